//! The device: global memory ownership and the work-group dispatcher.

use std::sync::Arc;

use crossbeam::queue::SegQueue;

use crate::error::Result;
use crate::ir::Function;
use crate::plugin::{MessageType, Plugin, PluginError};
use crate::sim::context::{Context, GlobalMemory};
use crate::sim::kernel::Kernel;
use crate::sim::spatial_dims::{NDRange, SpatialDims};
use crate::sim::work_group::WorkGroup;

/// Work-items per group the device accepts.
pub const MAX_WORK_GROUP_SIZE: usize = 1024;

/// Local memory available to one work-group, in bytes.
pub const MAX_LOCAL_MEM_SIZE: usize = 64 * 1024;

/// An error raised while setting up a launch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    #[error("no global work size specified")]
    NoGlobalWorkSize,
    #[error("invalid work size: {reason} (global: {global:?}, local: {local:?})")]
    InvalidWorkSize {
        reason: String,
        global: [usize; 3],
        local: [usize; 3],
    },
    #[error("argument {index} of kernel '{kernel}' has no binding")]
    UnboundArgument { kernel: String, index: u32 },
    #[error("kernel needs {needed} bytes of local memory, the device provides {available}")]
    LocalMemoryExceeded { needed: usize, available: usize },
}

/// Configures and creates a [`Device`].
#[derive(Debug, Clone, Default)]
pub struct DeviceBuilder {
    global_mem_cap: Option<usize>,
    parallel: bool,
    num_workers: Option<usize>,
}

impl DeviceBuilder {
    pub fn new() -> DeviceBuilder {
        DeviceBuilder::default()
    }

    /// Caps the global region at `bytes` of live allocations.
    pub fn global_mem_cap(mut self, bytes: usize) -> DeviceBuilder {
        self.global_mem_cap = Some(bytes);
        self
    }

    /// Runs work-groups on a worker pool instead of serially.
    ///
    /// Groups share only global memory; plugin notifications stay
    /// serialized whenever any registered plugin is not thread-safe.
    pub fn parallel(mut self, parallel: bool) -> DeviceBuilder {
        self.parallel = parallel;
        self
    }

    /// Number of worker threads for parallel group execution.
    pub fn num_workers(mut self, num_workers: usize) -> DeviceBuilder {
        self.num_workers = Some(num_workers);
        self
    }

    pub fn build(self) -> Device {
        let num_workers = self.num_workers.unwrap_or_else(|| {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        });
        Device {
            context: Arc::new(Context::new(self.global_mem_cap)),
            parallel: self.parallel,
            num_workers: num_workers.max(1),
        }
    }
}

/// A simulated compute device.
///
/// The device owns the global memory region (which persists across launches
/// and also backs the constant address space) and the plugin registry.
/// [`run`](Device::run) decomposes an N-D range into work-groups and drives
/// them to completion, serially in lexicographic group order by default.
#[derive(Debug)]
pub struct Device {
    context: Arc<Context>,
    parallel: bool,
    num_workers: usize,
}

impl Default for Device {
    fn default() -> Device {
        Device::new()
    }
}

impl Device {
    pub fn new() -> Device {
        Device::builder().build()
    }

    pub fn builder() -> DeviceBuilder {
        DeviceBuilder::new()
    }

    /// The host-side handle to this device's global memory.
    pub fn global_memory(&self) -> GlobalMemory {
        GlobalMemory::new(self.context.clone())
    }

    /// Registers an execution observer. Invalid during a launch.
    pub fn add_plugin(&self, plugin: Arc<dyn Plugin>) -> std::result::Result<(), PluginError> {
        self.context.plugins().add_plugin(plugin)
    }

    /// Unregisters an execution observer. Invalid during a launch.
    pub fn remove_plugin(&self, plugin: &Arc<dyn Plugin>) -> std::result::Result<(), PluginError> {
        self.context.plugins().remove_plugin(plugin)
    }

    pub fn max_work_group_size(&self) -> usize {
        MAX_WORK_GROUP_SIZE
    }

    pub fn max_local_mem_size(&self) -> usize {
        MAX_LOCAL_MEM_SIZE
    }

    /// Launches `kernel` over an N-D range.
    ///
    /// The offset, global, and local sizes are normalised to three
    /// dimensions (missing dimensions default to offset 0 and size 1). The
    /// launch fails before any group exists when a local size is zero or
    /// does not divide the global size, violates the kernel's required
    /// work-group size, exceeds a device maximum, or leaves a kernel
    /// argument unbound.
    ///
    /// Work-item faults during execution do not fail the launch; they are
    /// reported through the plugin bus and leave the faulted items'
    /// results undefined.
    pub fn run<O, G, L>(&self, kernel: &mut Kernel, offset: O, global: G, local: L) -> Result<()>
    where
        O: Into<SpatialDims>,
        G: Into<SpatialDims>,
        L: Into<SpatialDims>,
    {
        let result = self.run_inner(kernel, offset.into(), global.into(), local.into());
        if let Err(ref err) = result {
            self.context.plugins().log(MessageType::Error, &err.to_string());
        }
        result
    }

    fn run_inner(
        &self,
        kernel: &mut Kernel,
        offset: SpatialDims,
        global: SpatialDims,
        local: SpatialDims,
    ) -> Result<()> {
        let range = NDRange::new(kernel.required_work_group_size(), offset, global, local)?;
        if range.group_len() > MAX_WORK_GROUP_SIZE {
            return Err(LaunchError::InvalidWorkSize {
                reason: format!(
                    "work-group size {} exceeds the device maximum of {}",
                    range.group_len(),
                    MAX_WORK_GROUP_SIZE
                ),
                global: range.global_size,
                local: range.local_size,
            }
            .into());
        }
        if kernel.local_mem_size() > MAX_LOCAL_MEM_SIZE {
            return Err(LaunchError::LocalMemoryExceeded {
                needed: kernel.local_mem_size(),
                available: MAX_LOCAL_MEM_SIZE,
            }
            .into());
        }
        if let Some(index) = kernel.first_unbound() {
            return Err(LaunchError::UnboundArgument {
                kernel: kernel.name().to_owned(),
                index,
            }
            .into());
        }

        let plugins = self.context.plugins().clone();
        plugins.begin_launch();
        let result = self.dispatch(kernel, &range);
        plugins.kernel_end(kernel.name(), &range);
        let released = {
            let mut global_mem = self.context.global();
            kernel.deallocate_constants(&mut global_mem)
        };
        plugins.end_launch();
        result.and(released.map_err(Into::into))
    }

    fn dispatch(&self, kernel: &mut Kernel, range: &NDRange) -> Result<()> {
        {
            let mut global_mem = self.context.global();
            kernel.allocate_constants(&mut global_mem)?;
        }
        self.context.plugins().kernel_begin(kernel.name(), range);

        let mut groups = Vec::with_capacity(range.group_count());
        for gz in 0..range.num_groups[2] {
            for gy in 0..range.num_groups[1] {
                for gx in 0..range.num_groups[0] {
                    groups.push(WorkGroup::new(kernel, range, [gx, gy, gz], &self.context)?);
                }
            }
        }

        let function = kernel.function();
        if self.parallel && !interactive() && groups.len() > 1 {
            self.run_pooled(groups, function, range);
        } else {
            for mut group in groups {
                group.run(function, range, &self.context);
            }
        }
        Ok(())
    }

    fn run_pooled(&self, groups: Vec<WorkGroup>, function: &Function, range: &NDRange) {
        let queue = SegQueue::new();
        let num_groups = groups.len();
        for group in groups {
            queue.push(group);
        }
        let queue = &queue;
        let context = &self.context;
        let workers = self.num_workers.min(num_groups);
        let outcome = crossbeam::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(move |_| {
                    while let Some(mut group) = queue.pop() {
                        group.run(function, range, context);
                    }
                });
            }
        });
        if outcome.is_err() {
            log::error!("a work-group execution thread panicked");
        }
    }
}

/// `true` when the interactive hook is armed: the dispatcher then runs
/// groups serially so a debugger plugin, handed control at `kernel_begin`,
/// owns a deterministic event stream.
fn interactive() -> bool {
    std::env::var("OCLGRIND_INTERACTIVE").map(|v| v == "1").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::{FunctionBuilder, ModuleBuilder};
    use crate::ir::{AddressSpace, Builtin, Module, Operand, Type};
    use crate::sim::value::TypedValue;
    use crate::sim::work_item::WorkItemState;
    use std::sync::Mutex;

    /// Records lifecycle events for assertions.
    #[derive(Default)]
    struct Recorder {
        begins: Mutex<u32>,
        ends: Mutex<u32>,
        groups: Mutex<Vec<[usize; 3]>>,
        items: Mutex<Vec<([usize; 3], WorkItemState)>>,
    }

    impl Plugin for Recorder {
        fn is_thread_safe(&self) -> bool {
            true
        }

        fn kernel_begin(&self, _kernel_name: &str, _range: &NDRange) {
            *self.begins.lock().unwrap() += 1;
        }

        fn kernel_end(&self, _kernel_name: &str, _range: &NDRange) {
            *self.ends.lock().unwrap() += 1;
        }

        fn work_group_complete(&self, group_id: [usize; 3]) {
            self.groups.lock().unwrap().push(group_id);
        }

        fn work_item_complete(&self, global_id: [usize; 3], state: WorkItemState) {
            self.items.lock().unwrap().push((global_id, state));
        }
    }

    fn noop_module() -> Arc<Module> {
        let mut f = FunctionBuilder::new("noop");
        f.ret();
        Arc::new(ModuleBuilder::new().function(f.build()).build())
    }

    #[test]
    fn decomposition_enumerates_each_global_id_once() {
        let device = Device::new();
        let recorder = Arc::new(Recorder::default());
        device.add_plugin(recorder.clone()).unwrap();

        let mut kernel = Kernel::new(noop_module(), "noop").unwrap();
        device.run(&mut kernel, (), (8usize, 4usize), (2usize, 2usize)).unwrap();

        assert_eq!(recorder.groups.lock().unwrap().len(), 8);
        let mut ids: Vec<[usize; 3]> =
            recorder.items.lock().unwrap().iter().map(|&(id, _)| id).collect();
        assert_eq!(ids.len(), 32);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 32);
    }

    #[test]
    fn global_offset_shifts_ids() {
        let device = Device::new();
        let recorder = Arc::new(Recorder::default());
        device.add_plugin(recorder.clone()).unwrap();

        let mut kernel = Kernel::new(noop_module(), "noop").unwrap();
        device.run(&mut kernel, 10usize, 4usize, 2usize).unwrap();

        let mut ids: Vec<usize> =
            recorder.items.lock().unwrap().iter().map(|&(id, _)| id[0]).collect();
        ids.sort();
        assert_eq!(ids, vec![10, 11, 12, 13]);
    }

    #[test]
    fn invalid_work_size_fails_before_any_event() {
        let device = Device::new();
        let recorder = Arc::new(Recorder::default());
        device.add_plugin(recorder.clone()).unwrap();

        let mut kernel = Kernel::new(noop_module(), "noop").unwrap();
        let err = device.run(&mut kernel, (), 7usize, 2usize);
        assert!(err.is_err());
        assert_eq!(*recorder.begins.lock().unwrap(), 0);
        assert_eq!(*recorder.ends.lock().unwrap(), 0);
    }

    #[test]
    fn unbound_argument_fails_launch() {
        let mut f = FunctionBuilder::new("k");
        f.param("out", Type::pointer(Type::int(32), AddressSpace::Global));
        f.ret();
        let module = Arc::new(ModuleBuilder::new().function(f.build()).build());
        let device = Device::new();
        let mut kernel = Kernel::new(module, "k").unwrap();
        let err = device.run(&mut kernel, (), 1usize, ());
        assert!(err.is_err());
    }

    #[test]
    fn constants_are_staged_for_every_launch() {
        let mut f = FunctionBuilder::new("probe");
        let out = f.param("out", Type::pointer(Type::int(32), AddressSpace::Global));
        let table = Operand::GlobalVar(crate::ir::GlobalHandle::new(0));
        let second = f.ptr_add(table, Operand::imm64(1), 4);
        let v = f.load(second, Type::int(32), AddressSpace::Constant);
        f.store(v, out, AddressSpace::Global);
        f.ret();
        let init: Vec<Vec<u8>> =
            [21i32, 22].iter().map(|v| v.to_le_bytes().to_vec()).collect();
        let module = Arc::new(
            ModuleBuilder::new()
                .function(f.build())
                .global(
                    "T",
                    Type::array(Type::int(32), 2),
                    AddressSpace::Constant,
                    Some(crate::ir::Initializer::Array(init)),
                )
                .build(),
        );

        let device = Device::new();
        let mem = device.global_memory();
        let out_buf = mem.create_buffer(4).unwrap();
        let mut kernel = Kernel::new(module, "probe").unwrap();
        kernel.set_arg(0, TypedValue::pointer(out_buf)).unwrap();

        // Constants are re-staged per launch; both launches read the same
        // initializer contents through the fresh binding.
        for _ in 0..2 {
            mem.write(out_buf, &[0; 4]).unwrap();
            device.run(&mut kernel, (), 1usize, ()).unwrap();
            let out_bytes = mem.read(out_buf, 4).unwrap();
            let got =
                i32::from_le_bytes([out_bytes[0], out_bytes[1], out_bytes[2], out_bytes[3]]);
            assert_eq!(got, 22);
        }
        // The per-launch staging was torn down again.
        assert_eq!(kernel.constant_address("T"), None);
    }

    #[test]
    fn parallel_groups_produce_the_same_memory_result() {
        let mut f = FunctionBuilder::new("fill");
        let out = f.param("out", Type::pointer(Type::int(64), AddressSpace::Global));
        let gid = f.builtin(Builtin::GlobalId, Operand::imm32(0));
        let slot = f.ptr_add(out, gid, 8);
        let doubled = f.binary(crate::ir::BinaryOp::Mul, gid, Operand::imm64(2));
        f.store(doubled, slot, AddressSpace::Global);
        f.ret();
        let module = Arc::new(ModuleBuilder::new().function(f.build()).build());

        let device = Device::builder().parallel(true).num_workers(4).build();
        let mem = device.global_memory();
        let out_buf = mem.create_buffer(64 * 8).unwrap();
        let mut kernel = Kernel::new(module, "fill").unwrap();
        kernel.set_arg(0, TypedValue::pointer(out_buf)).unwrap();
        device.run(&mut kernel, (), 64usize, 4usize).unwrap();

        for i in 0..64usize {
            let b = mem.read(out_buf + (i * 8) as u64, 8).unwrap();
            let got = u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
            assert_eq!(got, (i * 2) as u64);
        }
    }

    #[test]
    fn faulting_items_do_not_fail_the_launch() {
        let mut f = FunctionBuilder::new("oob");
        let out = f.param("out", Type::pointer(Type::int(32), AddressSpace::Global));
        let gid = f.builtin(Builtin::GlobalId, Operand::imm32(0));
        let far = f.binary(crate::ir::BinaryOp::Add, gid, Operand::imm64(1000));
        let slot = f.ptr_add(out, far, 4);
        f.store(Operand::imm32(1), slot, AddressSpace::Global);
        f.ret();
        let module = Arc::new(ModuleBuilder::new().function(f.build()).build());

        let device = Device::new();
        let recorder = Arc::new(Recorder::default());
        device.add_plugin(recorder.clone()).unwrap();

        let mem = device.global_memory();
        let out_buf = mem.create_buffer(16).unwrap();
        let mut kernel = Kernel::new(module, "oob").unwrap();
        kernel.set_arg(0, TypedValue::pointer(out_buf)).unwrap();
        device.run(&mut kernel, (), 4usize, ()).unwrap();

        let items = recorder.items.lock().unwrap();
        assert_eq!(items.len(), 4);
        assert!(items.iter().all(|&(_, s)| s == WorkItemState::Faulted));
        assert_eq!(*recorder.ends.lock().unwrap(), 1);
    }
}
