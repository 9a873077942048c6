//! Shared per-device state: the global region and the plugin registry.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::ir::AddressSpace;
use crate::plugin::{Origin, PluginRegistry};
use crate::sim::memory::{Memory, MemoryError};

/// State shared by everything a device runs: the global memory region
/// (which also backs the constant address space) and the registered
/// plugins.
///
/// A `Context` is passed explicitly wherever it is needed; there are no
/// process-wide globals. Work-groups running in parallel share it behind an
/// `Arc`.
#[derive(Debug)]
pub struct Context {
    global: Mutex<Memory>,
    plugins: Arc<PluginRegistry>,
}

impl Context {
    pub(crate) fn new(global_mem_cap: Option<usize>) -> Context {
        let plugins = Arc::new(PluginRegistry::new());
        let global = match global_mem_cap {
            Some(cap) => Memory::with_capacity(AddressSpace::Global, cap, plugins.clone()),
            None => Memory::new(AddressSpace::Global, plugins.clone()),
        };
        Context { global: Mutex::new(global), plugins }
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    /// Locks the global region for exclusive access.
    ///
    /// Atomicity of the 32-bit primitives follows from this lock: a
    /// read-modify-write completes before the region is released.
    pub(crate) fn global(&self) -> MutexGuard<'_, Memory> {
        self.global.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A host-side handle to a device's global memory region.
///
/// This is the surface an API shim builds `clCreateBuffer`-equivalent
/// objects on. Host accesses through it are published to plugins as
/// `host_memory_load` / `host_memory_store`.
#[derive(Debug, Clone)]
pub struct GlobalMemory {
    context: Arc<Context>,
}

impl GlobalMemory {
    pub(crate) fn new(context: Arc<Context>) -> GlobalMemory {
        GlobalMemory { context }
    }

    /// Allocates a buffer of `size` bytes and returns its device address.
    pub fn create_buffer(&self, size: usize) -> Result<u64, MemoryError> {
        self.context.global().allocate(size, &Origin::Host)
    }

    /// Releases a buffer created with [`create_buffer`](Self::create_buffer).
    pub fn release_buffer(&self, address: u64) -> Result<(), MemoryError> {
        self.context.global().deallocate(address, &Origin::Host)
    }

    /// Copies `data` into the region at `address`.
    pub fn write(&self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.context.global().store(address, data, &Origin::Host)
    }

    /// Copies `size` bytes out of the region at `address`.
    pub fn read(&self, address: u64, size: usize) -> Result<Vec<u8>, MemoryError> {
        self.context.global().read(address, size, &Origin::Host)
    }

    /// Total bytes currently allocated in the region.
    pub fn used(&self) -> usize {
        self.context.global().used()
    }
}
