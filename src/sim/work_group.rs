//! A work-group: shared local memory plus a cooperative item scheduler.

use crate::ir::{AddressSpace, Function};
use crate::plugin::{MessageType, Origin};
use crate::sim::context::Context;
use crate::sim::kernel::Kernel;
use crate::sim::memory::{Memory, MemoryError};
use crate::sim::spatial_dims::NDRange;
use crate::sim::value::TypedValue;
use crate::sim::work_item::{WorkItem, WorkItemState};

/// A fixed-size block of work-items sharing one local memory region.
///
/// Items are stored row-major by local id (`lx` fastest: index
/// `lx + (lz * ny + ly) * nx`), and the scheduler visits them in exactly
/// that order, stepping each until it suspends or finishes. The visit
/// order is a contract, not an implementation detail: plugin event
/// ordering reproduces only because it is fixed.
#[derive(Debug)]
pub struct WorkGroup {
    group_id: [usize; 3],
    local: Memory,
    items: Vec<WorkItem>,
    faulted: bool,
}

impl WorkGroup {
    /// Materialises the group: allocates its local block, rebases the
    /// kernel's local-pointer bindings onto it, and creates one work-item
    /// per point of the local range with a snapshot of the bindings.
    pub(crate) fn new(
        kernel: &Kernel,
        range: &NDRange,
        group_id: [usize; 3],
        context: &Context,
    ) -> Result<WorkGroup, MemoryError> {
        let plugins = context.plugins().clone();
        let mut local = Memory::new(AddressSpace::Local, plugins.clone());
        let origin = Origin::WorkGroup { group_id };
        let base = if kernel.local_mem_size() > 0 {
            local.allocate(kernel.local_mem_size(), &origin)?
        } else {
            0
        };

        // Bindings hold group-relative offsets until here; each group
        // rebases them onto its own block.
        let mut args = kernel.snapshot_args();
        for (&key, value) in args.iter_mut() {
            if kernel.binding_space(key) == AddressSpace::Local {
                *value = TypedValue::pointer(base + value.as_address());
            }
        }

        let [nx, ny, nz] = range.local_size;
        let num_values = kernel.function().num_values;
        let mut items = Vec::with_capacity(range.group_len());
        for lz in 0..nz {
            for ly in 0..ny {
                for lx in 0..nx {
                    let local_id = [lx, ly, lz];
                    let mut global_id = [0; 3];
                    for d in 0..3 {
                        global_id[d] = group_id[d] * range.local_size[d]
                            + local_id[d]
                            + range.global_offset[d];
                    }
                    items.push(WorkItem::new(
                        global_id,
                        local_id,
                        group_id,
                        num_values,
                        args.clone(),
                        plugins.clone(),
                    ));
                }
            }
        }

        Ok(WorkGroup { group_id, local, items, faulted: false })
    }

    pub fn group_id(&self) -> [usize; 3] {
        self.group_id
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    /// `true` once the group has hit a group-scoped fault.
    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    /// Runs the group to completion.
    ///
    /// Each pass steps every `Ready` item in visit order until it suspends.
    /// When every live item is parked at the same barrier site with the
    /// same fence flags, the barrier is published and all items released;
    /// a finished item missing from the rendezvous, or mismatched sites,
    /// is a divergence fault for the whole group.
    pub(crate) fn run(&mut self, function: &Function, range: &NDRange, context: &Context) {
        loop {
            for idx in 0..self.items.len() {
                while let WorkItemState::Ready =
                    self.items[idx].step(function, range, &mut self.local, context)
                {}
            }

            let mut at_barrier = 0;
            let mut missing = 0;
            let mut site = None;
            let mut uniform = true;
            for item in &self.items {
                match item.state() {
                    WorkItemState::AtBarrier => {
                        at_barrier += 1;
                        match (site, item.barrier_site()) {
                            (None, s) => site = s,
                            (Some(a), Some(b)) if a != b => uniform = false,
                            _ => {}
                        }
                    }
                    // An item that finished or faulted can never arrive, so
                    // a waiting sibling would deadlock on it.
                    WorkItemState::Finished | WorkItemState::Faulted => missing += 1,
                    _ => {}
                }
            }

            if at_barrier == 0 {
                break;
            }
            if missing > 0 || !uniform {
                self.diverge(context);
                break;
            }
            if let Some(site) = site {
                context.plugins().work_group_barrier(self.group_id, site.flags);
            }
            for item in &mut self.items {
                item.release_barrier();
            }
        }
        context.plugins().work_group_complete(self.group_id);
    }

    fn diverge(&mut self, context: &Context) {
        self.faulted = true;
        let message = format!(
            "barrier divergence in work-group ({}, {}, {})",
            self.group_id[0], self.group_id[1], self.group_id[2]
        );
        context.plugins().log(MessageType::Error, &message);
        for item in &mut self.items {
            if item.state() == WorkItemState::AtBarrier {
                item.fault_externally(context);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::{FunctionBuilder, ModuleBuilder};
    use crate::ir::{Builtin, FenceFlags, IcmpPred, Module, Operand, Type};
    use crate::sim::value::TypedValue;
    use std::sync::Arc;

    fn single_group(module: Arc<Module>, name: &str, local: usize) -> (Kernel, NDRange) {
        let kernel = Kernel::new(module, name).unwrap();
        let range =
            NDRange::new([0; 3], ().into(), local.into(), local.into()).unwrap();
        (kernel, range)
    }

    /// Item 0 writes to local memory before the barrier; item 1 reads it
    /// after and copies it out to global memory.
    fn fence_module() -> Arc<Module> {
        let mut f = FunctionBuilder::new("fence");
        let scratch = f.param("scratch", Type::pointer(Type::int(32), AddressSpace::Local));
        let out = f.param("out", Type::pointer(Type::int(32), AddressSpace::Global));
        let writer = f.add_block();
        let rendezvous = f.add_block();
        let reader = f.add_block();
        let done = f.add_block();

        let lid = f.builtin(Builtin::LocalId, Operand::imm32(0));
        let is_writer = f.icmp(IcmpPred::Eq, lid, Operand::imm64(0));
        f.cond_br(is_writer, writer, rendezvous);

        f.set_block(writer);
        f.store(Operand::imm32(42), scratch, AddressSpace::Local);
        f.br(rendezvous);

        f.set_block(rendezvous);
        f.barrier(FenceFlags::LOCAL);
        let is_reader = f.icmp(IcmpPred::Eq, lid, Operand::imm64(1));
        f.cond_br(is_reader, reader, done);

        f.set_block(reader);
        let seen = f.load(scratch, Type::int(32), AddressSpace::Local);
        f.store(seen, out, AddressSpace::Global);
        f.br(done);

        f.set_block(done);
        f.ret();
        Arc::new(ModuleBuilder::new().function(f.build()).build())
    }

    #[test]
    fn barrier_fence_makes_writes_visible() {
        let context = Context::new(None);
        let out = context.global().allocate(4, &Origin::Host).unwrap();

        let (mut kernel, range) = single_group(fence_module(), "fence", 2);
        kernel.set_arg(0, TypedValue::zeroed(1, 4)).unwrap();
        kernel.set_arg(1, TypedValue::pointer(out)).unwrap();

        let mut group = WorkGroup::new(&kernel, &range, [0; 3], &context).unwrap();
        group.run(kernel.function(), &range, &context);

        assert!(!group.is_faulted());
        assert!(group
            .items()
            .iter()
            .all(|i| i.state() == WorkItemState::Finished));
        let bytes = context.global().read(out, 4, &Origin::Host).unwrap();
        assert_eq!(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 42);
    }

    /// Item 0 returns without reaching the barrier the others wait at.
    fn divergent_module() -> Arc<Module> {
        let mut f = FunctionBuilder::new("diverge");
        let skip = f.add_block();
        let wait = f.add_block();
        let lid = f.builtin(Builtin::LocalId, Operand::imm32(0));
        let is_zero = f.icmp(IcmpPred::Eq, lid, Operand::imm64(0));
        f.cond_br(is_zero, skip, wait);
        f.set_block(skip);
        f.ret();
        f.set_block(wait);
        f.barrier(FenceFlags::LOCAL);
        f.ret();
        Arc::new(ModuleBuilder::new().function(f.build()).build())
    }

    #[test]
    fn missing_barrier_participant_faults_group() {
        let context = Context::new(None);
        let (kernel, range) = single_group(divergent_module(), "diverge", 2);
        let mut group = WorkGroup::new(&kernel, &range, [0; 3], &context).unwrap();
        group.run(kernel.function(), &range, &context);

        assert!(group.is_faulted());
        assert_eq!(group.items()[0].state(), WorkItemState::Finished);
        assert_eq!(group.items()[1].state(), WorkItemState::Faulted);
    }

    #[test]
    fn item_ids_are_row_major() {
        let mut f = FunctionBuilder::new("noop");
        f.ret();
        let module = Arc::new(ModuleBuilder::new().function(f.build()).build());
        let kernel = Kernel::new(module, "noop").unwrap();
        let range = NDRange::new(
            [0; 3],
            ().into(),
            (4usize, 2usize, 2usize).into(),
            (2usize, 2usize, 1usize).into(),
        )
        .unwrap();
        let group = WorkGroup::new(&kernel, &range, [1, 0, 1], &context_for()).unwrap();
        let ids: Vec<[usize; 3]> = group.items().iter().map(|i| i.local_id()).collect();
        assert_eq!(ids, vec![[0, 0, 0], [1, 0, 0], [0, 1, 0], [1, 1, 0]]);
        // gd = group_d * local_size_d + ld + offset_d
        assert_eq!(group.items()[3].global_id(), [3, 1, 1]);
    }

    fn context_for() -> Context {
        Context::new(None)
    }
}
