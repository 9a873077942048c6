//! The execution engine: memory regions, kernels, work-items, work-groups,
//! and the device dispatcher.

mod context;
mod device;
mod kernel;
mod memory;
mod spatial_dims;
mod value;
mod work_group;
mod work_item;

pub use self::context::{Context, GlobalMemory};
pub use self::device::{
    Device, DeviceBuilder, LaunchError, MAX_LOCAL_MEM_SIZE, MAX_WORK_GROUP_SIZE,
};
pub use self::kernel::{ArgKey, Kernel, KernelError};
pub use self::memory::{Memory, MemoryError};
pub use self::spatial_dims::{NDRange, SpatialDims};
pub use self::value::TypedValue;
pub use self::work_group::WorkGroup;
pub use self::work_item::{WorkItem, WorkItemState};
