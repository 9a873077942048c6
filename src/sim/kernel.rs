//! A kernel: an immutable program entry point plus mutable argument state.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ir::{AddressSpace, Function, GlobalHandle, Initializer, Module, POINTER_SIZE};
use crate::plugin::{MessageType, Origin};
use crate::sim::memory::{Memory, MemoryError};
use crate::sim::value::TypedValue;

/// An error related to kernel construction or argument binding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("no kernel named '{0}' in program")]
    NoSuchKernel(String),
    #[error("kernel arg index out of range (kernel: {kernel}, index: {index})")]
    ArgIdxOor { kernel: String, index: u32 },
    #[error(
        "kernel argument size mismatch (kernel: {kernel}, index: {index}, \
         expected: {expected}, found: {found})"
    )]
    ArgSizeMismatch {
        kernel: String,
        index: u32,
        expected: usize,
        found: usize,
    },
    #[error("unhandled constant initializer shape for '{name}'")]
    UnhandledConstant { name: String },
}

/// Identity of an argument binding.
///
/// Formal parameters bind by position; module-scope variables (static local
/// reservations, staged constants) bind by their module handle. Both are
/// plain values, so binding maps never hold references into the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ArgKey {
    Param(u32),
    Global(GlobalHandle),
}

/// A kernel function with its argument bindings and per-program constants.
///
/// Construction captures everything immutable up front: the function's
/// name, the `reqd_work_group_size` metadata, a local-memory offset for
/// every module-scope `local` variable (their sum is the kernel's static
/// local-memory size), and the ordered list of `constant` variables staged
/// per launch by [`allocate_constants`](Kernel::allocate_constants).
///
/// A `Kernel` is not safe to launch from two dispatchers at once: `set_arg`
/// mutates the binding map and the local-memory cursor, and a launch reads
/// a snapshot of both.
#[derive(Debug, Clone)]
pub struct Kernel {
    module: Arc<Module>,
    function: usize,
    name: String,
    reqd_work_group_size: [usize; 3],
    args: BTreeMap<ArgKey, TypedValue>,
    local_mem_size: usize,
    constants: Vec<GlobalHandle>,
    constant_allocs: Vec<(GlobalHandle, u64)>,
}

impl Kernel {
    /// Looks up `name` in `module` and prepares it for argument binding.
    pub fn new(module: Arc<Module>, name: &str) -> Result<Kernel, KernelError> {
        let function = module
            .function_index(name)
            .ok_or_else(|| KernelError::NoSuchKernel(name.to_owned()))?;
        let reqd_work_group_size = module.reqd_work_group_size(name).unwrap_or([0; 3]);

        let mut args = BTreeMap::new();
        let mut local_mem_size = 0;
        let mut constants = Vec::new();
        for (handle, var) in module.globals() {
            match var.space {
                AddressSpace::Local => {
                    args.insert(ArgKey::Global(handle), TypedValue::pointer(local_mem_size as u64));
                    local_mem_size += var.ty.size();
                }
                AddressSpace::Constant => constants.push(handle),
                _ => {}
            }
        }

        Ok(Kernel {
            module,
            function,
            name: name.to_owned(),
            reqd_work_group_size,
            args,
            local_mem_size,
            constants,
            constant_allocs: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `reqd_work_group_size` triple, zero meaning unconstrained.
    pub fn required_work_group_size(&self) -> [usize; 3] {
        self.reqd_work_group_size
    }

    pub fn num_args(&self) -> u32 {
        self.function().params.len() as u32
    }

    /// Size of the value bound at `index`: pointer width for pointer
    /// parameters, value width otherwise.
    pub fn arg_size(&self, index: u32) -> Result<usize, KernelError> {
        let param = self.param(index)?;
        Ok(if param.ty.is_pointer() { POINTER_SIZE } else { param.ty.size() })
    }

    /// The address-space classification of parameter `index`.
    pub fn arg_address_space(&self, index: u32) -> Result<AddressSpace, KernelError> {
        Ok(self.param(index)?.address_space())
    }

    /// Bytes of local memory this kernel needs per work-group: the static
    /// module-scope reservations plus every dynamic request bound so far.
    pub fn local_mem_size(&self) -> usize {
        self.local_mem_size
    }

    /// Bytes of the global region staged for program-scope constants.
    pub fn global_size(&self) -> usize {
        self.constants
            .iter()
            .map(|&h| self.module.global(h).ty.size())
            .sum()
    }

    /// Iterates over current argument bindings in key order.
    pub fn bindings(&self) -> impl Iterator<Item = (&ArgKey, &TypedValue)> {
        self.args.iter()
    }

    /// Binds formal parameter `index`.
    ///
    /// For a `local` pointer parameter the value's byte length is the
    /// requested dynamic local size: a fresh local offset is reserved, the
    /// parameter is bound to a pointer holding it, and the kernel's
    /// local-memory size grows by the request. For other pointer parameters
    /// the value must be a device address (`size_t`). For scalar and vector
    /// parameters the value is cloned and re-laned to the parameter type's
    /// element layout.
    ///
    /// On error the prior binding, if any, is left in place.
    pub fn set_arg(&mut self, index: u32, value: TypedValue) -> Result<(), KernelError> {
        let param = self.param(index)?;
        let ty = param.ty.clone();
        let key = ArgKey::Param(index);

        match ty.pointer_space() {
            Some(AddressSpace::Local) => {
                let requested = value.size();
                let offset = self.local_mem_size;
                self.args.insert(key, TypedValue::pointer(offset as u64));
                self.local_mem_size += requested;
            }
            Some(_) => {
                if value.size() != POINTER_SIZE {
                    return Err(self.size_mismatch(index, POINTER_SIZE, value.size()));
                }
                self.args.insert(key, value);
            }
            None => {
                if value.size() != ty.size() {
                    return Err(self.size_mismatch(index, ty.size(), value.size()));
                }
                let (elem_size, count) = ty.lanes();
                let relaned = TypedValue::with_layout(value.bytes().to_vec(), elem_size, count)
                    .ok_or_else(|| self.size_mismatch(index, ty.size(), value.size()))?;
                self.args.insert(key, relaned);
            }
        }
        Ok(())
    }

    /// Stages every program-scope constant into the global region.
    ///
    /// Each constant gets a buffer sized to its type, its initializer
    /// serialized into it (arrays element-by-element, primitives directly,
    /// missing initializers zero-filled), and a pointer binding under its
    /// handle. Initializer shapes the engine cannot serialize are logged
    /// and skipped.
    pub fn allocate_constants(&mut self, global: &mut Memory) -> Result<(), MemoryError> {
        for &handle in &self.constants {
            let var = self.module.global(handle);
            let bytes = match serialize_initializer(var.initializer.as_ref(), var.ty.size()) {
                Some(bytes) => bytes,
                None => {
                    let err = KernelError::UnhandledConstant { name: var.name.clone() };
                    global.plugins().log(MessageType::Warning, &err.to_string());
                    continue;
                }
            };
            let address = global.allocate(var.ty.size(), &Origin::Host)?;
            global.store(address, &bytes, &Origin::Host)?;
            self.args.insert(ArgKey::Global(handle), TypedValue::pointer(address));
            self.constant_allocs.push((handle, address));
        }
        Ok(())
    }

    /// Releases the buffers staged by
    /// [`allocate_constants`](Kernel::allocate_constants) and drops their
    /// bindings.
    pub fn deallocate_constants(&mut self, global: &mut Memory) -> Result<(), MemoryError> {
        for (handle, address) in std::mem::take(&mut self.constant_allocs) {
            global.deallocate(address, &Origin::Host)?;
            self.args.remove(&ArgKey::Global(handle));
        }
        Ok(())
    }

    /// The staged address of the named program-scope constant, if any.
    pub fn constant_address(&self, name: &str) -> Option<u64> {
        self.constant_allocs
            .iter()
            .find(|&&(handle, _)| self.module.global(handle).name == name)
            .map(|&(_, address)| address)
    }

    pub(crate) fn function(&self) -> &Function {
        self.module.function_at(self.function)
    }

    pub(crate) fn module(&self) -> &Arc<Module> {
        &self.module
    }

    /// Clones the binding map for one launch.
    pub(crate) fn snapshot_args(&self) -> BTreeMap<ArgKey, TypedValue> {
        self.args.clone()
    }

    /// The address space a binding's pointer value resolves against.
    pub(crate) fn binding_space(&self, key: ArgKey) -> AddressSpace {
        match key {
            ArgKey::Param(index) => self.function().params[index as usize].address_space(),
            ArgKey::Global(handle) => self.module.global(handle).space,
        }
    }

    /// The lowest unbound formal parameter, if any.
    pub(crate) fn first_unbound(&self) -> Option<u32> {
        (0..self.num_args()).find(|&i| !self.args.contains_key(&ArgKey::Param(i)))
    }

    fn param(&self, index: u32) -> Result<&crate::ir::Parameter, KernelError> {
        self.function().params.get(index as usize).ok_or_else(|| KernelError::ArgIdxOor {
            kernel: self.name.clone(),
            index,
        })
    }

    fn size_mismatch(&self, index: u32, expected: usize, found: usize) -> KernelError {
        KernelError::ArgSizeMismatch {
            kernel: self.name.clone(),
            index,
            expected,
            found,
        }
    }
}

fn serialize_initializer(initializer: Option<&Initializer>, size: usize) -> Option<Vec<u8>> {
    let mut bytes = match initializer {
        None => vec![0; size],
        Some(Initializer::Scalar(b)) => b.clone(),
        Some(Initializer::Array(elems)) => elems.iter().flatten().copied().collect(),
        Some(Initializer::Aggregate(..)) => return None,
    };
    bytes.resize(size, 0);
    Some(bytes)
}
