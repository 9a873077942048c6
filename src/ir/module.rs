//! The immutable program representation consumed by the execution engine.
//!
//! A [`Module`] is produced by a front-end loader (or by
//! [`builder`](crate::ir::builder) in tests) and never mutated afterwards.
//! The engine only requires what is modelled here: enumerable functions,
//! ordered formal parameters with address-space tags, module-scope variables
//! with optional initializers, and per-kernel launch-constraint metadata.

use crate::ir::instruction::Instruction;
use crate::ir::types::{AddressSpace, Type};

/// A stable handle to a module-scope variable.
///
/// Handles index into the module's variable table and are valid for the
/// lifetime of the module; they are used as value-typed keys in kernel
/// argument maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalHandle(pub(crate) u32);

impl GlobalHandle {
    /// The handle of the `index`-th module-scope variable, in declaration
    /// order.
    pub fn new(index: u32) -> GlobalHandle {
        GlobalHandle(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A formal kernel parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub ty: Type,
}

impl Parameter {
    /// The address space this parameter's value lives in or points into.
    ///
    /// Non-pointer parameters are passed by value and classify as `Private`.
    pub fn address_space(&self) -> AddressSpace {
        self.ty.pointer_space().unwrap_or(AddressSpace::Private)
    }

    /// Size of the bound value: pointer width for pointers, value width
    /// otherwise.
    pub fn binding_size(&self) -> usize {
        self.ty.size()
    }
}

/// A module-scope variable initializer.
#[derive(Debug, Clone, PartialEq)]
pub enum Initializer {
    /// Raw little-endian bytes of a primitive value.
    Scalar(Vec<u8>),
    /// Element-by-element bytes of a flat array.
    Array(Vec<Vec<u8>>),
    /// A nested aggregate. The engine cannot serialize these; staging logs
    /// the limitation and skips the variable.
    Aggregate(Vec<Initializer>),
}

/// A module-scope variable.
///
/// `ty` is the pointee type; references to the variable are pointers into
/// the region named by `space`.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalVariable {
    pub name: String,
    pub ty: Type,
    pub space: AddressSpace,
    pub initializer: Option<Initializer>,
}

/// A basic block: a straight-line instruction run ending in a terminator.
#[derive(Debug, Clone, PartialEq)]
pub struct BasicBlock {
    pub instructions: Vec<Instruction>,
}

/// A function in SSA form.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<Parameter>,
    pub blocks: Vec<BasicBlock>,
    /// Number of SSA value ids used; sizes the register file.
    pub num_values: u32,
}

/// Per-kernel metadata attached by the front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelMetadata {
    pub kernel_name: String,
    /// The `reqd_work_group_size` triple, when declared.
    pub reqd_work_group_size: Option<[usize; 3]>,
}

/// An immutable, linked, verified program.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub(crate) functions: Vec<Function>,
    pub(crate) globals: Vec<GlobalVariable>,
    pub(crate) metadata: Vec<KernelMetadata>,
}

impl Module {
    /// Looks up a function by name.
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub(crate) fn function_index(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }

    pub(crate) fn function_at(&self, index: usize) -> &Function {
        &self.functions[index]
    }

    /// Iterates over all functions.
    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter()
    }

    /// Iterates over module-scope variables with their handles.
    pub fn globals(&self) -> impl Iterator<Item = (GlobalHandle, &GlobalVariable)> {
        self.globals
            .iter()
            .enumerate()
            .map(|(i, g)| (GlobalHandle(i as u32), g))
    }

    /// Resolves a variable handle.
    pub fn global(&self, handle: GlobalHandle) -> &GlobalVariable {
        &self.globals[handle.index()]
    }

    /// The `reqd_work_group_size` declared for `kernel_name`, if any.
    pub fn reqd_work_group_size(&self, kernel_name: &str) -> Option<[usize; 3]> {
        self.metadata
            .iter()
            .find(|m| m.kernel_name == kernel_name)
            .and_then(|m| m.reqd_work_group_size)
    }
}
