//! The observer bus: pluggable analyses notified of every execution event.
//!
//! A [`Plugin`] is registered with a device and receives synchronous,
//! ordered callbacks for memory traffic, instruction retirement, barriers,
//! and work-item lifecycle events. Delivery happens in the thread that
//! caused the event, before the originating operation returns to the
//! interpreter, so a plugin always observes a linear extension of each
//! work-item's program order.
//!
//! Race detectors, tracers, and interactive debuggers are all expressed as
//! plugins; none ship with the engine itself.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::ir::{AddressSpace, FenceFlags, Instruction};
use crate::sim::{NDRange, WorkItemState};

/// Severity of a message published on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Debug,
    Info,
    Warning,
    Error,
}

/// Who caused a memory operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The host, outside any work-item (buffer setup, constant staging).
    Host,
    /// A work-item, identified by its global id.
    WorkItem {
        global_id: [usize; 3],
        group_id: [usize; 3],
    },
    /// A work-group as a whole (local-memory management).
    WorkGroup { group_id: [usize; 3] },
}

/// An execution observer.
///
/// Every callback has a no-op default; implement only the capabilities the
/// analysis needs. Callbacks take `&self`: a plugin carries its own interior
/// mutability and declares via [`is_thread_safe`](Plugin::is_thread_safe)
/// whether it may be invoked from several group threads at once. When any
/// registered plugin is not thread-safe, the registry serializes all
/// notifications through a single lock.
///
/// Plugins may publish [`log`](PluginRegistry::log) messages from within a
/// callback; raising any other notification from a callback is rejected and
/// reported.
#[allow(unused_variables)]
pub trait Plugin: Send + Sync {
    /// `true` if this plugin may be called concurrently from multiple
    /// work-group threads.
    fn is_thread_safe(&self) -> bool {
        false
    }

    fn kernel_begin(&self, kernel_name: &str, range: &NDRange) {}

    fn kernel_end(&self, kernel_name: &str, range: &NDRange) {}

    fn host_memory_load(&self, address: u64, size: usize) {}

    fn host_memory_store(&self, address: u64, size: usize) {}

    fn memory_allocated(&self, space: AddressSpace, origin: &Origin, address: u64, size: usize) {}

    fn memory_deallocated(&self, space: AddressSpace, origin: &Origin, address: u64) {}

    fn memory_load(&self, space: AddressSpace, origin: &Origin, address: u64, size: usize) {}

    fn memory_store(&self, space: AddressSpace, origin: &Origin, address: u64, size: usize) {}

    fn memory_atomic_load(&self, space: AddressSpace, origin: &Origin, address: u64, value: u32) {}

    fn memory_atomic_store(&self, space: AddressSpace, origin: &Origin, address: u64, value: u32) {}

    fn instruction_executed(&self, origin: &Origin, instruction: &Instruction) {}

    fn work_group_barrier(&self, group_id: [usize; 3], flags: FenceFlags) {}

    fn work_group_complete(&self, group_id: [usize; 3]) {}

    fn work_item_complete(&self, global_id: [usize; 3], state: WorkItemState) {}

    fn log(&self, kind: MessageType, message: &str) {}
}

/// An error related to plugin registration or callback discipline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
    #[error("plugin callbacks may not raise further notifications")]
    InvalidPluginCallback,
    #[error("plugin registration is not permitted during a launch")]
    RegistrationDuringLaunch,
    #[error("plugin is not registered")]
    NotRegistered,
}

thread_local! {
    static NOTIFYING: Cell<bool> = Cell::new(false);
}

/// The registered observers of one device.
///
/// Observers are held in registration order; for a single plugin the event
/// sequence is a total order consistent with the program order of each
/// originating work-item.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
    in_launch: AtomicBool,
    serialize: AtomicBool,
    dispatch_lock: Mutex<()>,
}

impl PluginRegistry {
    pub fn new() -> PluginRegistry {
        PluginRegistry::default()
    }

    /// Registers an observer. Invalid during a launch.
    pub fn add_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        if self.in_launch.load(Ordering::Acquire) {
            self.report(PluginError::RegistrationDuringLaunch);
            return Err(PluginError::RegistrationDuringLaunch);
        }
        let mut plugins = self.write_plugins();
        plugins.push(plugin);
        let serialize = plugins.iter().any(|p| !p.is_thread_safe());
        self.serialize.store(serialize, Ordering::Release);
        Ok(())
    }

    /// Unregisters an observer by identity. Invalid during a launch.
    pub fn remove_plugin(&self, plugin: &Arc<dyn Plugin>) -> Result<(), PluginError> {
        if self.in_launch.load(Ordering::Acquire) {
            self.report(PluginError::RegistrationDuringLaunch);
            return Err(PluginError::RegistrationDuringLaunch);
        }
        let mut plugins = self.write_plugins();
        let before = plugins.len();
        plugins.retain(|p| !Arc::ptr_eq(p, plugin));
        if plugins.len() == before {
            return Err(PluginError::NotRegistered);
        }
        let serialize = plugins.iter().any(|p| !p.is_thread_safe());
        self.serialize.store(serialize, Ordering::Release);
        Ok(())
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.read_plugins().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publishes a message to every observer and mirrors it to the `log`
    /// facade. Permitted from within plugin callbacks.
    pub fn log(&self, kind: MessageType, message: &str) {
        match kind {
            MessageType::Debug => log::debug!("{}", message),
            MessageType::Info => log::info!("{}", message),
            MessageType::Warning => log::warn!("{}", message),
            MessageType::Error => log::error!("{}", message),
        }
        if NOTIFYING.with(|c| c.get()) {
            // Already inside a notification on this thread: the dispatch
            // lock (when engaged) is held, so deliver directly.
            for p in self.read_plugins().iter() {
                p.log(kind, message);
            }
        } else {
            self.notify(|p| p.log(kind, message));
        }
    }

    pub(crate) fn begin_launch(&self) {
        self.in_launch.store(true, Ordering::Release);
    }

    pub(crate) fn end_launch(&self) {
        self.in_launch.store(false, Ordering::Release);
    }

    pub(crate) fn kernel_begin(&self, kernel_name: &str, range: &NDRange) {
        self.notify(|p| p.kernel_begin(kernel_name, range));
    }

    pub(crate) fn kernel_end(&self, kernel_name: &str, range: &NDRange) {
        self.notify(|p| p.kernel_end(kernel_name, range));
    }

    pub(crate) fn host_memory_load(&self, address: u64, size: usize) {
        self.notify(|p| p.host_memory_load(address, size));
    }

    pub(crate) fn host_memory_store(&self, address: u64, size: usize) {
        self.notify(|p| p.host_memory_store(address, size));
    }

    pub(crate) fn memory_allocated(
        &self,
        space: AddressSpace,
        origin: &Origin,
        address: u64,
        size: usize,
    ) {
        self.notify(|p| p.memory_allocated(space, origin, address, size));
    }

    pub(crate) fn memory_deallocated(&self, space: AddressSpace, origin: &Origin, address: u64) {
        self.notify(|p| p.memory_deallocated(space, origin, address));
    }

    pub(crate) fn memory_load(
        &self,
        space: AddressSpace,
        origin: &Origin,
        address: u64,
        size: usize,
    ) {
        self.notify(|p| p.memory_load(space, origin, address, size));
    }

    pub(crate) fn memory_store(
        &self,
        space: AddressSpace,
        origin: &Origin,
        address: u64,
        size: usize,
    ) {
        self.notify(|p| p.memory_store(space, origin, address, size));
    }

    pub(crate) fn memory_atomic_load(
        &self,
        space: AddressSpace,
        origin: &Origin,
        address: u64,
        value: u32,
    ) {
        self.notify(|p| p.memory_atomic_load(space, origin, address, value));
    }

    pub(crate) fn memory_atomic_store(
        &self,
        space: AddressSpace,
        origin: &Origin,
        address: u64,
        value: u32,
    ) {
        self.notify(|p| p.memory_atomic_store(space, origin, address, value));
    }

    pub(crate) fn instruction_executed(&self, origin: &Origin, instruction: &Instruction) {
        self.notify(|p| p.instruction_executed(origin, instruction));
    }

    pub(crate) fn work_group_barrier(&self, group_id: [usize; 3], flags: FenceFlags) {
        self.notify(|p| p.work_group_barrier(group_id, flags));
    }

    pub(crate) fn work_group_complete(&self, group_id: [usize; 3]) {
        self.notify(|p| p.work_group_complete(group_id));
    }

    pub(crate) fn work_item_complete(&self, global_id: [usize; 3], state: WorkItemState) {
        self.notify(|p| p.work_item_complete(global_id, state));
    }

    fn notify<F: Fn(&dyn Plugin)>(&self, f: F) {
        if NOTIFYING.with(|c| c.get()) {
            self.report(PluginError::InvalidPluginCallback);
            return;
        }
        let _serial = if self.serialize.load(Ordering::Acquire) {
            Some(lock_recover(&self.dispatch_lock))
        } else {
            None
        };
        NOTIFYING.with(|c| c.set(true));
        for p in self.read_plugins().iter() {
            f(&**p);
        }
        NOTIFYING.with(|c| c.set(false));
    }

    // Rejected notifications and registration misuse are reported on the bus
    // itself; NOTIFYING stays untouched so the delivery is direct.
    fn report(&self, err: PluginError) {
        log::error!("{}", err);
        for p in self.read_plugins().iter() {
            p.log(MessageType::Error, &err.to_string());
        }
    }

    fn read_plugins(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<dyn Plugin>>> {
        self.plugins.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_plugins(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<dyn Plugin>>> {
        self.plugins.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn lock_recover<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.len())
            .field("in_launch", &self.in_launch.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Counter {
        logs: Mutex<Vec<String>>,
    }

    impl Plugin for Counter {
        fn is_thread_safe(&self) -> bool {
            true
        }

        fn log(&self, _kind: MessageType, message: &str) {
            self.logs.lock().unwrap().push(message.to_owned());
        }
    }

    #[test]
    fn log_reaches_every_plugin_in_order() {
        let registry = PluginRegistry::new();
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        registry.add_plugin(a.clone()).unwrap();
        registry.add_plugin(b.clone()).unwrap();
        registry.log(MessageType::Info, "one");
        registry.log(MessageType::Info, "two");
        assert_eq!(*a.logs.lock().unwrap(), vec!["one", "two"]);
        assert_eq!(*b.logs.lock().unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn registration_rejected_during_launch() {
        let registry = PluginRegistry::new();
        let p: Arc<dyn Plugin> = Arc::new(Counter::default());
        registry.begin_launch();
        assert_eq!(
            registry.add_plugin(p.clone()),
            Err(PluginError::RegistrationDuringLaunch)
        );
        registry.end_launch();
        registry.add_plugin(p.clone()).unwrap();
        assert_eq!(registry.len(), 1);
        registry.remove_plugin(&p).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_unknown_plugin_fails() {
        let registry = PluginRegistry::new();
        let p: Arc<dyn Plugin> = Arc::new(Counter::default());
        assert_eq!(registry.remove_plugin(&p), Err(PluginError::NotRegistered));
    }

    /// A plugin that tries to raise a non-log notification from a callback.
    struct Reentrant {
        registry: std::sync::Weak<PluginRegistry>,
        rejected: Mutex<Vec<String>>,
    }

    impl Plugin for Reentrant {
        fn is_thread_safe(&self) -> bool {
            true
        }

        fn work_group_complete(&self, _group_id: [usize; 3]) {
            if let Some(registry) = self.registry.upgrade() {
                // Forbidden: a nested non-log notification.
                registry.work_group_barrier([0; 3], crate::ir::FenceFlags::LOCAL);
            }
        }

        fn work_group_barrier(&self, _group_id: [usize; 3], _flags: crate::ir::FenceFlags) {
            panic!("nested notification must not be delivered");
        }

        fn log(&self, kind: MessageType, message: &str) {
            if kind == MessageType::Error {
                self.rejected.lock().unwrap().push(message.to_owned());
            }
        }
    }

    #[test]
    fn reentrant_notification_rejected() {
        let registry = Arc::new(PluginRegistry::new());
        let plugin = Arc::new(Reentrant {
            registry: Arc::downgrade(&registry),
            rejected: Mutex::new(Vec::new()),
        });
        registry.add_plugin(plugin.clone()).unwrap();
        registry.work_group_complete([0; 3]);
        let rejected = plugin.rejected.lock().unwrap();
        assert_eq!(rejected.len(), 1);
        assert!(rejected[0].contains("notifications"));
    }
}
