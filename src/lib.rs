//! A simulator for an OpenCL 1.x compute device.
//!
//! `oclsim` executes compiled kernel programs (an LLVM-style SSA form
//! produced by a front-end loader) on the host CPU, reproducing the
//! observable semantics of a conforming device: an N-dimensional range of
//! work-items partitioned into work-groups, the four-level address-space
//! memory model (global, constant, local, private), barrier
//! synchronization, and atomic operations on global and local memory.
//!
//! Every memory access, instruction retirement, barrier, and work-item
//! lifecycle event is published synchronously to registered [`Plugin`]s,
//! which is what makes the engine useful as a substrate for race
//! detectors, tracers, and interactive debuggers.
//!
//! The crate deliberately stops at the device boundary: it does not parse
//! IR text, implement the OpenCL host API, or ship any concrete plugin.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use oclsim::ir::builder::{FunctionBuilder, ModuleBuilder};
//! use oclsim::ir::{AddressSpace, Builtin, Operand, Type};
//! use oclsim::{Device, Kernel, TypedValue};
//!
//! // kernel void copy(global int* in, global int* out)
//! //     { out[get_global_id(0)] = in[get_global_id(0)]; }
//! let mut f = FunctionBuilder::new("copy");
//! let src = f.param("in", Type::pointer(Type::int(32), AddressSpace::Global));
//! let dst = f.param("out", Type::pointer(Type::int(32), AddressSpace::Global));
//! let gid = f.builtin(Builtin::GlobalId, Operand::imm32(0));
//! let from = f.ptr_add(src, gid, 4);
//! let v = f.load(from, Type::int(32), AddressSpace::Global);
//! let slot = f.ptr_add(dst, gid, 4);
//! f.store(v, slot, AddressSpace::Global);
//! f.ret();
//! let module = Arc::new(ModuleBuilder::new().function(f.build()).build());
//!
//! let device = Device::new();
//! let mem = device.global_memory();
//! let input = mem.create_buffer(16)?;
//! let output = mem.create_buffer(16)?;
//! mem.write(input, &[1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0, 4, 0, 0, 0])?;
//!
//! let mut kernel = Kernel::new(module, "copy")?;
//! kernel.set_arg(0, TypedValue::pointer(input))?;
//! kernel.set_arg(1, TypedValue::pointer(output))?;
//! device.run(&mut kernel, (), 4usize, 2usize)?;
//!
//! assert_eq!(mem.read(output, 16)?, mem.read(input, 16)?);
//! # Ok::<(), oclsim::Error>(())
//! ```

pub mod error;
pub mod ir;
pub mod plugin;
pub mod sim;

pub use crate::error::{Error, Result};
pub use crate::ir::{AddressSpace, FenceFlags, Module, Type};
pub use crate::plugin::{MessageType, Origin, Plugin, PluginRegistry};
pub use crate::sim::{
    Device, DeviceBuilder, GlobalMemory, Kernel, NDRange, SpatialDims, TypedValue, WorkGroup,
    WorkItem, WorkItemState,
};
