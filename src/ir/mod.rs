//! The intermediate program representation the engine executes.
//!
//! Programs arrive here already parsed and linked by a front-end loader; the
//! engine never sees IR text. See [`builder`] for in-memory assembly.

pub mod builder;
mod instruction;
mod module;
mod types;

pub use self::instruction::{
    AtomicOp, BinaryOp, Builtin, FenceFlags, IcmpPred, Instruction, Operand, ValueId,
};
pub use self::module::{
    BasicBlock, Function, GlobalHandle, GlobalVariable, Initializer, KernelMetadata, Module,
    Parameter,
};
pub use self::types::{AddressSpace, Type, POINTER_SIZE};
