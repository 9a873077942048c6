//! A single point of kernel execution and its instruction interpreter.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ir::{
    AddressSpace, BinaryOp, Builtin, FenceFlags, Function, IcmpPred, Instruction, Operand, ValueId,
};
use crate::plugin::{MessageType, Origin, PluginRegistry};
use crate::sim::context::Context;
use crate::sim::kernel::ArgKey;
use crate::sim::memory::{Memory, MemoryError};
use crate::sim::spatial_dims::NDRange;
use crate::sim::value::TypedValue;

/// Execution state of a work-item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItemState {
    /// Able to retire the next instruction.
    Ready,
    /// Suspended at a barrier, waiting for the rest of the group.
    AtBarrier,
    /// Returned from the kernel function.
    Finished,
    /// Stopped by a fault; does not cancel siblings.
    Faulted,
}

/// The static barrier site a suspended item is parked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BarrierSite {
    pub block: usize,
    pub inst: usize,
    pub flags: FenceFlags,
}

#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("use of undefined value %{0}")]
    UndefinedValue(ValueId),
    #[error("use of unbound kernel argument {0}")]
    UnboundArg(u32),
    #[error("use of unstaged module variable @{0}")]
    UnstagedGlobal(usize),
    #[error("integer division by zero")]
    DivisionByZero,
    #[error("control transfer to invalid block {0}")]
    BadBlock(usize),
    #[error("control fell off the end of block {0}")]
    MissingTerminator(usize),
}

enum Flow {
    Next,
    Jump(usize),
    Barrier(FenceFlags),
    Return,
}

/// One work-item: a program counter, a register file keyed by SSA value
/// identity, and a private memory region.
///
/// Execution is instruction-at-a-time: [`step`](WorkItem::step) retires the
/// next instruction, publishes it to the plugin bus, advances the program
/// counter, and returns the new state. A barrier suspends the item without
/// moving the counter past the barrier; the group scheduler releases it
/// once the whole group has arrived.
#[derive(Debug)]
pub struct WorkItem {
    global_id: [usize; 3],
    local_id: [usize; 3],
    group_id: [usize; 3],
    state: WorkItemState,
    block: usize,
    inst: usize,
    registers: Vec<Option<TypedValue>>,
    args: BTreeMap<ArgKey, TypedValue>,
    private: Memory,
    barrier: Option<BarrierSite>,
}

impl WorkItem {
    pub(crate) fn new(
        global_id: [usize; 3],
        local_id: [usize; 3],
        group_id: [usize; 3],
        num_values: u32,
        args: BTreeMap<ArgKey, TypedValue>,
        plugins: Arc<PluginRegistry>,
    ) -> WorkItem {
        WorkItem {
            global_id,
            local_id,
            group_id,
            state: WorkItemState::Ready,
            block: 0,
            inst: 0,
            registers: vec![None; num_values as usize],
            args,
            private: Memory::new(AddressSpace::Private, plugins),
            barrier: None,
        }
    }

    pub fn global_id(&self) -> [usize; 3] {
        self.global_id
    }

    pub fn local_id(&self) -> [usize; 3] {
        self.local_id
    }

    pub fn group_id(&self) -> [usize; 3] {
        self.group_id
    }

    pub fn state(&self) -> WorkItemState {
        self.state
    }

    pub(crate) fn barrier_site(&self) -> Option<BarrierSite> {
        self.barrier
    }

    fn origin(&self) -> Origin {
        Origin::WorkItem { global_id: self.global_id, group_id: self.group_id }
    }

    /// Retires the next instruction and returns the new state.
    pub(crate) fn step(
        &mut self,
        function: &Function,
        range: &NDRange,
        local: &mut Memory,
        context: &Context,
    ) -> WorkItemState {
        if self.state != WorkItemState::Ready {
            return self.state;
        }

        let instruction = match self.fetch(function) {
            Ok(instruction) => instruction.clone(),
            Err(err) => return self.fault(context, err),
        };

        match self.exec(&instruction, function, range, local, context) {
            Ok(Flow::Next) => {
                context.plugins().instruction_executed(&self.origin(), &instruction);
                self.inst += 1;
            }
            Ok(Flow::Jump(target)) => {
                context.plugins().instruction_executed(&self.origin(), &instruction);
                self.block = target;
                self.inst = 0;
            }
            Ok(Flow::Barrier(flags)) => {
                context.plugins().instruction_executed(&self.origin(), &instruction);
                self.barrier = Some(BarrierSite { block: self.block, inst: self.inst, flags });
                self.state = WorkItemState::AtBarrier;
            }
            Ok(Flow::Return) => {
                context.plugins().instruction_executed(&self.origin(), &instruction);
                self.state = WorkItemState::Finished;
                context.plugins().work_item_complete(self.global_id, self.state);
            }
            Err(err) => return self.fault(context, err),
        }
        self.state
    }

    /// Moves a suspended item past its barrier and back to `Ready`.
    pub(crate) fn release_barrier(&mut self) {
        if self.state == WorkItemState::AtBarrier {
            self.barrier = None;
            self.inst += 1;
            self.state = WorkItemState::Ready;
        }
    }

    /// Marks the item faulted without it having stepped (group-scoped
    /// faults such as barrier divergence land here).
    pub(crate) fn fault_externally(&mut self, context: &Context) {
        self.barrier = None;
        self.state = WorkItemState::Faulted;
        context.plugins().work_item_complete(self.global_id, self.state);
    }

    fn fault(&mut self, context: &Context, err: StepError) -> WorkItemState {
        let message = format!(
            "work-item ({}, {}, {}) faulted: {}",
            self.global_id[0], self.global_id[1], self.global_id[2], err
        );
        context.plugins().log(MessageType::Error, &message);
        self.state = WorkItemState::Faulted;
        context.plugins().work_item_complete(self.global_id, self.state);
        self.state
    }

    fn fetch<'f>(&self, function: &'f Function) -> Result<&'f Instruction, StepError> {
        let block = function
            .blocks
            .get(self.block)
            .ok_or(StepError::BadBlock(self.block))?;
        block
            .instructions
            .get(self.inst)
            .ok_or(StepError::MissingTerminator(self.block))
    }

    fn exec(
        &mut self,
        instruction: &Instruction,
        function: &Function,
        range: &NDRange,
        local: &mut Memory,
        context: &Context,
    ) -> Result<Flow, StepError> {
        let origin = self.origin();
        match *instruction {
            Instruction::Binary { op, result, ref lhs, ref rhs } => {
                let a = self.operand(lhs)?;
                let b = self.operand(rhs)?;
                let value = binary(op, &a, &b)?;
                self.set_register(result, value);
                Ok(Flow::Next)
            }
            Instruction::Icmp { pred, result, ref lhs, ref rhs } => {
                let a = self.operand(lhs)?;
                let b = self.operand(rhs)?;
                self.set_register(result, icmp(pred, &a, &b));
                Ok(Flow::Next)
            }
            Instruction::Select { result, ref cond, ref if_true, ref if_false } => {
                let cond = self.operand(cond)?;
                let value = if cond.as_u64() != 0 {
                    self.operand(if_true)?
                } else {
                    self.operand(if_false)?
                };
                self.set_register(result, value);
                Ok(Flow::Next)
            }
            Instruction::PtrAdd { result, ref base, ref index, elem_size } => {
                let base = self.operand(base)?.as_address();
                let index = self.operand(index)?.lane_i64(0);
                let address = (base as i64).wrapping_add(index.wrapping_mul(elem_size as i64));
                self.set_register(result, TypedValue::pointer(address as u64));
                Ok(Flow::Next)
            }
            Instruction::Alloca { result, size } => {
                let address = self.private.allocate(size, &origin)?;
                self.set_register(result, TypedValue::pointer(address));
                Ok(Flow::Next)
            }
            Instruction::Load { result, ref addr, ref ty, space } => {
                let address = self.operand(addr)?.as_address();
                let (elem_size, count) = ty.lanes();
                let mut value = TypedValue::zeroed(elem_size, count);
                match space {
                    AddressSpace::Private => {
                        self.private.load(address, value.bytes_mut(), &origin)?
                    }
                    AddressSpace::Local => local.load(address, value.bytes_mut(), &origin)?,
                    AddressSpace::Global | AddressSpace::Constant => {
                        context.global().load(address, value.bytes_mut(), &origin)?
                    }
                }
                self.set_register(result, value);
                Ok(Flow::Next)
            }
            Instruction::Store { ref value, ref addr, space } => {
                let value = self.operand(value)?;
                let address = self.operand(addr)?.as_address();
                match space {
                    AddressSpace::Private => self.private.store(address, value.bytes(), &origin)?,
                    AddressSpace::Local => local.store(address, value.bytes(), &origin)?,
                    AddressSpace::Global | AddressSpace::Constant => {
                        context.global().store(address, value.bytes(), &origin)?
                    }
                }
                Ok(Flow::Next)
            }
            Instruction::AtomicRmw { op, result, ref addr, ref operand, space } => {
                let address = self.operand(addr)?.as_address();
                let operand = self.operand(operand)?.as_u32();
                let old = match space {
                    AddressSpace::Private => self.private.atomic_rmw(op, address, operand, &origin)?,
                    AddressSpace::Local => local.atomic_rmw(op, address, operand, &origin)?,
                    AddressSpace::Global | AddressSpace::Constant => {
                        context.global().atomic_rmw(op, address, operand, &origin)?
                    }
                };
                self.set_register(result, TypedValue::from_u32(old));
                Ok(Flow::Next)
            }
            Instruction::CmpXchg { result, ref addr, ref expected, ref replacement, space } => {
                let address = self.operand(addr)?.as_address();
                let expected = self.operand(expected)?.as_u32();
                let replacement = self.operand(replacement)?.as_u32();
                let old = match space {
                    AddressSpace::Private => {
                        self.private.atomic_cmpxchg(address, expected, replacement, &origin)?
                    }
                    AddressSpace::Local => {
                        local.atomic_cmpxchg(address, expected, replacement, &origin)?
                    }
                    AddressSpace::Global | AddressSpace::Constant => {
                        context.global().atomic_cmpxchg(address, expected, replacement, &origin)?
                    }
                };
                self.set_register(result, TypedValue::from_u32(old));
                Ok(Flow::Next)
            }
            Instruction::Builtin { result, func, ref dim } => {
                let dim = self.operand(dim)?.as_u64() as usize;
                self.set_register(result, self.query(func, dim, range));
                Ok(Flow::Next)
            }
            Instruction::Barrier { flags } => Ok(Flow::Barrier(flags)),
            Instruction::Br { target } => {
                if target >= function.blocks.len() {
                    return Err(StepError::BadBlock(target));
                }
                Ok(Flow::Jump(target))
            }
            Instruction::CondBr { ref cond, if_true, if_false } => {
                let target = if self.operand(cond)?.as_u64() != 0 { if_true } else { if_false };
                if target >= function.blocks.len() {
                    return Err(StepError::BadBlock(target));
                }
                Ok(Flow::Jump(target))
            }
            Instruction::Ret => Ok(Flow::Return),
        }
    }

    fn query(&self, func: Builtin, dim: usize, range: &NDRange) -> TypedValue {
        let value = match func {
            Builtin::WorkDim => range.work_dim as u64,
            // Out-of-range dimensions answer like the device would: zero
            // for ids and offsets, one for sizes and counts.
            _ if dim > 2 => match func {
                Builtin::GlobalSize | Builtin::LocalSize | Builtin::NumGroups => 1,
                _ => 0,
            },
            Builtin::GlobalId => self.global_id[dim] as u64,
            Builtin::LocalId => self.local_id[dim] as u64,
            Builtin::GroupId => self.group_id[dim] as u64,
            Builtin::GlobalSize => range.global_size[dim] as u64,
            Builtin::LocalSize => range.local_size[dim] as u64,
            Builtin::NumGroups => range.num_groups[dim] as u64,
            Builtin::GlobalOffset => range.global_offset[dim] as u64,
        };
        TypedValue::from_u64(value, 8)
    }

    fn operand(&self, operand: &Operand) -> Result<TypedValue, StepError> {
        match *operand {
            Operand::Value(id) => self
                .registers
                .get(id as usize)
                .and_then(|v| v.clone())
                .ok_or(StepError::UndefinedValue(id)),
            Operand::Arg(index) => self
                .args
                .get(&ArgKey::Param(index))
                .cloned()
                .ok_or(StepError::UnboundArg(index)),
            Operand::GlobalVar(handle) => self
                .args
                .get(&ArgKey::Global(handle))
                .cloned()
                .ok_or(StepError::UnstagedGlobal(handle.index())),
            Operand::Imm { value, size } => Ok(TypedValue::from_u64(value as u64, size)),
        }
    }

    fn set_register(&mut self, id: ValueId, value: TypedValue) {
        self.registers[id as usize] = Some(value);
    }
}

fn binary(op: BinaryOp, a: &TypedValue, b: &TypedValue) -> Result<TypedValue, StepError> {
    let elem_size = a.elem_size();
    let count = a.count();
    let mut out = TypedValue::zeroed(elem_size, count);
    for lane in 0..count {
        // A single-lane rhs broadcasts across a vector lhs.
        let bl = if b.count() == count { lane } else { 0 };
        match op {
            BinaryOp::FAdd | BinaryOp::FSub | BinaryOp::FMul | BinaryOp::FDiv => {
                let x = a.lane_f64(lane);
                let y = b.lane_f64(bl);
                let value = match op {
                    BinaryOp::FAdd => x + y,
                    BinaryOp::FSub => x - y,
                    BinaryOp::FMul => x * y,
                    _ => x / y,
                };
                out.set_lane_f64(lane, value);
            }
            _ => {
                let x = a.lane_u64(lane);
                let y = b.lane_u64(bl);
                let sx = a.lane_i64(lane);
                let sy = b.lane_i64(bl);
                let bits = (elem_size.min(8) * 8) as u64;
                let value = match op {
                    BinaryOp::Add => x.wrapping_add(y),
                    BinaryOp::Sub => x.wrapping_sub(y),
                    BinaryOp::Mul => x.wrapping_mul(y),
                    BinaryOp::UDiv => x.checked_div(y).ok_or(StepError::DivisionByZero)?,
                    BinaryOp::SDiv => {
                        sx.checked_div(sy).ok_or(StepError::DivisionByZero)? as u64
                    }
                    BinaryOp::URem => x.checked_rem(y).ok_or(StepError::DivisionByZero)?,
                    BinaryOp::SRem => {
                        sx.checked_rem(sy).ok_or(StepError::DivisionByZero)? as u64
                    }
                    BinaryOp::And => x & y,
                    BinaryOp::Or => x | y,
                    BinaryOp::Xor => x ^ y,
                    BinaryOp::Shl => x.wrapping_shl((y % bits) as u32),
                    BinaryOp::LShr => x.wrapping_shr((y % bits) as u32),
                    BinaryOp::AShr => sx.wrapping_shr((y % bits) as u32) as u64,
                    _ => 0,
                };
                out.set_lane_u64(lane, value);
            }
        }
    }
    Ok(out)
}

fn icmp(pred: IcmpPred, a: &TypedValue, b: &TypedValue) -> TypedValue {
    let count = a.count();
    let mut out = TypedValue::zeroed(1, count);
    for lane in 0..count {
        let bl = if b.count() == count { lane } else { 0 };
        let x = a.lane_u64(lane);
        let y = b.lane_u64(bl);
        let sx = a.lane_i64(lane);
        let sy = b.lane_i64(bl);
        let hit = match pred {
            IcmpPred::Eq => x == y,
            IcmpPred::Ne => x != y,
            IcmpPred::Ult => x < y,
            IcmpPred::Ule => x <= y,
            IcmpPred::Ugt => x > y,
            IcmpPred::Uge => x >= y,
            IcmpPred::Slt => sx < sy,
            IcmpPred::Sle => sx <= sy,
            IcmpPred::Sgt => sx > sy,
            IcmpPred::Sge => sx >= sy,
        };
        out.set_lane_u64(lane, hit as u64);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::Type;

    fn run_to_completion(item: &mut WorkItem, function: &Function, context: &Context) {
        let range = NDRange::new([0; 3], ().into(), 1usize.into(), ().into()).unwrap();
        let mut local = Memory::new(AddressSpace::Local, context.plugins().clone());
        for _ in 0..1000 {
            match item.step(function, &range, &mut local, context) {
                WorkItemState::Ready => continue,
                _ => break,
            }
        }
    }

    #[test]
    fn arithmetic_and_private_memory() {
        let mut f = FunctionBuilder::new("t");
        let buf = f.alloca(4);
        let sum = f.binary(BinaryOp::Add, Operand::imm32(2), Operand::imm32(3));
        f.store(sum, buf, AddressSpace::Private);
        let loaded = f.load(buf, Type::int(32), AddressSpace::Private);
        let doubled = f.binary(BinaryOp::Mul, loaded, Operand::imm32(10));
        f.store(doubled, buf, AddressSpace::Private);
        f.ret();
        let function = f.build();

        let context = Context::new(None);
        let mut item = WorkItem::new(
            [0; 3],
            [0; 3],
            [0; 3],
            function.num_values,
            BTreeMap::new(),
            context.plugins().clone(),
        );
        run_to_completion(&mut item, &function, &context);
        assert_eq!(item.state(), WorkItemState::Finished);
    }

    #[test]
    fn division_by_zero_faults() {
        let mut f = FunctionBuilder::new("t");
        f.binary(BinaryOp::UDiv, Operand::imm32(1), Operand::imm32(0));
        f.ret();
        let function = f.build();

        let context = Context::new(None);
        let mut item = WorkItem::new(
            [0; 3],
            [0; 3],
            [0; 3],
            function.num_values,
            BTreeMap::new(),
            context.plugins().clone(),
        );
        run_to_completion(&mut item, &function, &context);
        assert_eq!(item.state(), WorkItemState::Faulted);
    }

    #[test]
    fn branching_follows_condition() {
        let mut f = FunctionBuilder::new("t");
        let buf = f.alloca(4);
        let then_block = f.add_block();
        let else_block = f.add_block();
        let done = f.add_block();
        let cond = f.icmp(IcmpPred::Slt, Operand::imm32(1), Operand::imm32(2));
        f.cond_br(cond, then_block, else_block);
        f.set_block(then_block);
        f.store(Operand::imm32(111), buf, AddressSpace::Private);
        f.br(done);
        f.set_block(else_block);
        f.store(Operand::imm32(222), buf, AddressSpace::Private);
        f.br(done);
        f.set_block(done);
        let v = f.load(buf, Type::int(32), AddressSpace::Private);
        // Keep the result observable through a register.
        f.binary(BinaryOp::Add, v, Operand::imm32(0));
        f.ret();
        let function = f.build();

        let context = Context::new(None);
        let mut item = WorkItem::new(
            [0; 3],
            [0; 3],
            [0; 3],
            function.num_values,
            BTreeMap::new(),
            context.plugins().clone(),
        );
        run_to_completion(&mut item, &function, &context);
        assert_eq!(item.state(), WorkItemState::Finished);
        let loaded = item.registers.iter().rev().flatten().next().unwrap();
        assert_eq!(loaded.as_u32(), 111);
    }

    #[test]
    fn geometry_builtins() {
        let range =
            NDRange::new([0; 3], 4usize.into(), 16usize.into(), 4usize.into()).unwrap();
        let context = Context::new(None);
        let item = WorkItem::new(
            [6, 0, 0],
            [2, 0, 0],
            [1, 0, 0],
            0,
            BTreeMap::new(),
            context.plugins().clone(),
        );
        assert_eq!(item.query(Builtin::GlobalId, 0, &range).as_u64(), 6);
        assert_eq!(item.query(Builtin::LocalId, 0, &range).as_u64(), 2);
        assert_eq!(item.query(Builtin::GroupId, 0, &range).as_u64(), 1);
        assert_eq!(item.query(Builtin::GlobalSize, 0, &range).as_u64(), 16);
        assert_eq!(item.query(Builtin::LocalSize, 0, &range).as_u64(), 4);
        assert_eq!(item.query(Builtin::NumGroups, 0, &range).as_u64(), 4);
        assert_eq!(item.query(Builtin::GlobalOffset, 0, &range).as_u64(), 4);
        assert_eq!(item.query(Builtin::WorkDim, 0, &range).as_u64(), 1);
        // Out-of-range dimensions.
        assert_eq!(item.query(Builtin::GlobalId, 7, &range).as_u64(), 0);
        assert_eq!(item.query(Builtin::GlobalSize, 7, &range).as_u64(), 1);
    }
}
