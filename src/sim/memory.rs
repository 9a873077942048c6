//! A flat, byte-addressable memory region with tagged allocations.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ir::{AddressSpace, AtomicOp};
use crate::plugin::{Origin, PluginRegistry};

/// Allocation bases are aligned to this, which covers every natural
/// alignment up to the widest vector lane.
const BASE_ALIGN: u64 = 16;

/// The first address handed out; zero stays permanently invalid so a null
/// pointer always faults.
const FIRST_ADDRESS: u64 = BASE_ALIGN;

/// A fault raised by a memory operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("invalid {space} memory access: {size} bytes at {address:#x}")]
    InvalidAddress {
        space: AddressSpace,
        address: u64,
        size: usize,
    },
    #[error("unaligned {space} memory access: {size} bytes at {address:#x}")]
    Unaligned {
        space: AddressSpace,
        address: u64,
        size: usize,
    },
    #[error("{space} memory exhausted: requested {requested} bytes, {available} available")]
    OutOfMemory {
        space: AddressSpace,
        requested: usize,
        available: usize,
    },
}

/// A logically contiguous byte space with an allocating front end.
///
/// Addresses are opaque, stable until deallocation, and never alias across
/// live allocations. Every access must fall entirely within one live
/// allocation; anything else is a [`MemoryError`] fault, never undefined
/// behaviour. Four regions exist per launch: one global (owned by the
/// device, shared, also backing the constant space), one local per
/// work-group, and one private per work-item.
///
/// Each successful operation is published on the plugin bus, attributed to
/// the given [`Origin`].
#[derive(Debug)]
pub struct Memory {
    space: AddressSpace,
    allocations: BTreeMap<u64, Vec<u8>>,
    next_address: u64,
    capacity: Option<usize>,
    used: usize,
    plugins: Arc<PluginRegistry>,
}

impl Memory {
    /// An unbounded region tagged `space`.
    pub fn new(space: AddressSpace, plugins: Arc<PluginRegistry>) -> Memory {
        Memory {
            space,
            allocations: BTreeMap::new(),
            next_address: FIRST_ADDRESS,
            capacity: None,
            used: 0,
            plugins,
        }
    }

    /// A region capped at `capacity` bytes of live allocations.
    pub fn with_capacity(
        space: AddressSpace,
        capacity: usize,
        plugins: Arc<PluginRegistry>,
    ) -> Memory {
        Memory { capacity: Some(capacity), ..Memory::new(space, plugins) }
    }

    pub fn space(&self) -> AddressSpace {
        self.space
    }

    pub(crate) fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    /// Total bytes currently allocated.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Reserves a fresh range of `size` bytes and returns its base address.
    pub fn allocate(&mut self, size: usize, origin: &Origin) -> Result<u64, MemoryError> {
        if let Some(capacity) = self.capacity {
            let available = capacity.saturating_sub(self.used);
            if size > available {
                return Err(MemoryError::OutOfMemory {
                    space: self.space,
                    requested: size,
                    available,
                });
            }
        }
        let base = self.next_address;
        self.next_address = align_up(base + size.max(1) as u64, BASE_ALIGN);
        self.used += size;
        self.allocations.insert(base, vec![0; size]);
        self.plugins.memory_allocated(self.space, origin, base, size);
        Ok(base)
    }

    /// Frees the range beginning at `address`.
    ///
    /// Subsequent access to any byte of the range, including a second free,
    /// faults with `InvalidAddress`.
    pub fn deallocate(&mut self, address: u64, origin: &Origin) -> Result<(), MemoryError> {
        match self.allocations.remove(&address) {
            Some(buffer) => {
                self.used -= buffer.len();
                self.plugins.memory_deallocated(self.space, origin, address);
                Ok(())
            }
            None => Err(MemoryError::InvalidAddress {
                space: self.space,
                address,
                size: 0,
            }),
        }
    }

    /// Reads exactly `out.len()` bytes starting at `address`.
    pub fn load(&self, address: u64, out: &mut [u8], origin: &Origin) -> Result<(), MemoryError> {
        let size = out.len();
        self.check_alignment(address, size)?;
        let bytes = self.range(address, size)?;
        out.copy_from_slice(bytes);
        match *origin {
            Origin::Host => self.plugins.host_memory_load(address, size),
            _ => self.plugins.memory_load(self.space, origin, address, size),
        }
        Ok(())
    }

    /// Reads `size` bytes starting at `address` into a fresh buffer.
    pub fn read(&self, address: u64, size: usize, origin: &Origin) -> Result<Vec<u8>, MemoryError> {
        let mut out = vec![0; size];
        self.load(address, &mut out, origin)?;
        Ok(out)
    }

    /// Writes all of `data` starting at `address`.
    pub fn store(&mut self, address: u64, data: &[u8], origin: &Origin) -> Result<(), MemoryError> {
        let size = data.len();
        self.check_alignment(address, size)?;
        let bytes = self.range_mut(address, size)?;
        bytes.copy_from_slice(data);
        match *origin {
            Origin::Host => self.plugins.host_memory_store(address, size),
            _ => self.plugins.memory_store(self.space, origin, address, size),
        }
        Ok(())
    }

    /// Atomically reads the 32-bit word at `address`.
    pub fn atomic_load(&mut self, address: u64, origin: &Origin) -> Result<u32, MemoryError> {
        let value = self.word(address)?;
        self.plugins.memory_atomic_load(self.space, origin, address, value);
        Ok(value)
    }

    /// Atomically writes the 32-bit word at `address`.
    pub fn atomic_store(
        &mut self,
        address: u64,
        value: u32,
        origin: &Origin,
    ) -> Result<(), MemoryError> {
        self.set_word(address, value)?;
        self.plugins.memory_atomic_store(self.space, origin, address, value);
        Ok(())
    }

    /// A single indivisible read-modify-write of the 32-bit word at
    /// `address`; returns the old value.
    ///
    /// The region is held exclusively for the whole operation, so concurrent
    /// atomics on one word are linearizable. Non-atomic access racing with
    /// an atomic is a data race for a race detector plugin to flag, not a
    /// fault.
    pub fn atomic_rmw(
        &mut self,
        op: AtomicOp,
        address: u64,
        operand: u32,
        origin: &Origin,
    ) -> Result<u32, MemoryError> {
        let old = self.word(address)?;
        let new = apply_atomic(op, old, operand);
        self.set_word(address, new)?;
        self.plugins.memory_atomic_load(self.space, origin, address, old);
        self.plugins.memory_atomic_store(self.space, origin, address, new);
        Ok(old)
    }

    /// Atomic compare-exchange of the 32-bit word at `address`; returns the
    /// old value.
    pub fn atomic_cmpxchg(
        &mut self,
        address: u64,
        expected: u32,
        replacement: u32,
        origin: &Origin,
    ) -> Result<u32, MemoryError> {
        let old = self.word(address)?;
        let new = if old == expected { replacement } else { old };
        self.set_word(address, new)?;
        self.plugins.memory_atomic_load(self.space, origin, address, old);
        self.plugins.memory_atomic_store(self.space, origin, address, new);
        Ok(old)
    }

    /// `true` if `[address, address + size)` lies within one live
    /// allocation.
    pub fn is_valid(&self, address: u64, size: usize) -> bool {
        self.range(address, size).is_ok()
    }

    fn check_alignment(&self, address: u64, size: usize) -> Result<(), MemoryError> {
        // Natural-alignment requests only: scalar and vector power-of-two
        // widths. Odd-sized aggregate copies are exempt.
        if size > 1 && size <= 16 && size.is_power_of_two() && address % size as u64 != 0 {
            return Err(MemoryError::Unaligned { space: self.space, address, size });
        }
        Ok(())
    }

    fn range(&self, address: u64, size: usize) -> Result<&[u8], MemoryError> {
        let fault = MemoryError::InvalidAddress { space: self.space, address, size };
        let (base, buffer) = self
            .allocations
            .range(..=address)
            .next_back()
            .ok_or(fault)?;
        let offset = (address - base) as usize;
        if size == 0 || offset + size > buffer.len() {
            return Err(fault);
        }
        Ok(&buffer[offset..offset + size])
    }

    fn range_mut(&mut self, address: u64, size: usize) -> Result<&mut [u8], MemoryError> {
        let space = self.space;
        let fault = MemoryError::InvalidAddress { space, address, size };
        let (base, buffer) = self
            .allocations
            .range_mut(..=address)
            .next_back()
            .ok_or(fault)?;
        let offset = (address - base) as usize;
        if size == 0 || offset + size > buffer.len() {
            return Err(fault);
        }
        Ok(&mut buffer[offset..offset + size])
    }

    fn word(&self, address: u64) -> Result<u32, MemoryError> {
        self.check_alignment(address, 4)?;
        let bytes = self.range(address, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn set_word(&mut self, address: u64, value: u32) -> Result<(), MemoryError> {
        self.check_alignment(address, 4)?;
        let bytes = self.range_mut(address, 4)?;
        bytes.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

fn apply_atomic(op: AtomicOp, old: u32, operand: u32) -> u32 {
    match op {
        AtomicOp::Add => old.wrapping_add(operand),
        AtomicOp::Sub => old.wrapping_sub(operand),
        AtomicOp::Inc => old.wrapping_add(1),
        AtomicOp::Dec => old.wrapping_sub(1),
        AtomicOp::Min => (old as i32).min(operand as i32) as u32,
        AtomicOp::Max => (old as i32).max(operand as i32) as u32,
        AtomicOp::And => old & operand,
        AtomicOp::Or => old | operand,
        AtomicOp::Xor => old ^ operand,
        AtomicOp::Xchg => operand,
    }
}
