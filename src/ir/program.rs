// This module holds Program, the operator/variable store a front end fills through the
// emission interface and every later phase rewrites in place. Emission is infallible from
// the caller's point of view: when the arena budget runs out the program switches to dry-run
// mode, every further call becomes a no-op returning OperatorHandle::NONE or VarId::NONE,
// and the stored error is returned from compile. Structural partners of loops, branches and
// subroutines are linked automatically while emitting, using a nesting stack; calls are linked
// to their subroutine explicitly. The crate-internal half of the API maintains the per-variable
// producer chains (descending program order) and the provider/consumer links the optimizer
// and the analyses rely on.

//! Operator/variable store and emission interface.

use super::links::{LinkTable, LINK_SIZE};
use super::{Addressing, OpFlags, OpIdx, Opcode, Operator, SpanIdx, VarId, VarType, Variable};
use crate::core::error::{CompileError, CompileResult};
use crate::core::session::CompilationSession;
use crate::ir::ControlKind;
use log::{trace, warn};
use std::mem::size_of;

/// Index into the constant pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolIdx(pub u32);

/// Arena-backed constant payload with its reference count.
#[derive(Debug, Clone, Copy)]
pub struct ConstantEntry<'a> {
    pub data: &'a [u8],
    pub refs: u32,
}

/// Stable reference to an emitted operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorHandle(Option<OpIdx>);

impl OperatorHandle {
    /// Returned while the program is in dry-run mode.
    pub const NONE: OperatorHandle = OperatorHandle(None);

    pub fn is_none(self) -> bool {
        self.0.is_none()
    }

    pub fn index(self) -> Option<OpIdx> {
        self.0
    }
}

/// A program under construction and, later, under compilation.
pub struct Program<'a> {
    session: &'a CompilationSession<'a>,
    pub(crate) vars: Vec<Variable>,
    pub(crate) ops: Vec<Operator>,
    pub(crate) links: LinkTable,
    pub(crate) constants: Vec<ConstantEntry<'a>>,
    /// Open loop, branch and subroutine operators.
    structure: Vec<OpIdx>,
    dry_run: bool,
    deferred: Option<CompileError>,
}

impl<'a> Program<'a> {
    pub fn new(session: &'a CompilationSession<'a>) -> Self {
        let placeholder = Variable {
            ty: VarType::I64,
            initialized: false,
            producer_head: None,
        };
        Self {
            session,
            vars: vec![placeholder],
            ops: Vec::new(),
            links: LinkTable::new(),
            constants: Vec::new(),
            structure: Vec::new(),
            dry_run: false,
            deferred: None,
        }
    }

    pub fn session(&self) -> &'a CompilationSession<'a> {
        self.session
    }

    /// Whether emission has been turned into a no-op by an earlier failure.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Allocate a new variable; ids are monotonic and 0 is never returned.
    pub fn alloc_var(&mut self, ty: VarType) -> VarId {
        if self.dry_run {
            return VarId::NONE;
        }
        match self.new_var(ty) {
            Ok(var) => var,
            Err(err) => {
                self.enter_dry_run(err);
                VarId::NONE
            }
        }
    }

    /// Append an operator in program order.
    pub fn add_operator(
        &mut self,
        opcode: Opcode,
        result: VarId,
        op1: VarId,
        op2: VarId,
        op3: VarId,
    ) -> OperatorHandle {
        if self.dry_run {
            return OperatorHandle::NONE;
        }
        if let Err(err) = self.session.charge(size_of::<Operator>()) {
            self.enter_dry_run(err);
            return OperatorHandle::NONE;
        }

        let info = opcode.info();
        let operands = [op1, op2, op3];
        if let Some(bad) = std::iter::once(result)
            .chain(operands)
            .find(|var| var.index() >= self.vars.len())
        {
            self.defer(CompileError::internal(format!(
                "{} references unknown variable {}",
                info.name, bad
            )));
            return OperatorHandle::NONE;
        }
        if result.is_some() && !info.has_result {
            self.defer(CompileError::internal(format!(
                "{} cannot produce a result",
                info.name
            )));
            return OperatorHandle::NONE;
        }
        if operands[info.operands as usize..].iter().any(|v| v.is_some()) {
            self.defer(CompileError::internal(format!(
                "{} takes {} operands",
                info.name, info.operands
            )));
            return OperatorHandle::NONE;
        }

        let idx = OpIdx(self.ops.len() as u32);
        for var in operands.iter().filter(|v| v.is_some()) {
            if !self.vars[var.index()].initialized {
                warn!("{} at {} reads {} before any operator writes it", info.name, idx, var);
            }
        }

        self.ops.push(Operator {
            opcode,
            result,
            operands,
            addressing: Addressing::Direct,
            imm: 0,
            pool: None,
            order: idx.0,
            span: SpanIdx(0),
            flags: OpFlags::default(),
            linked: None,
            next_producer: None,
        });
        self.links.ensure_ops(self.ops.len());

        if result.is_some() {
            self.vars[result.index()].initialized = true;
            // Newest operator, so it becomes the chain head.
            let var = &mut self.vars[result.index()];
            self.ops[idx.index()].next_producer = var.producer_head;
            var.producer_head = Some(idx);
        }

        match info.control {
            Some(ControlKind::LoopStart | ControlKind::BranchSplit | ControlKind::SubStart) => {
                self.structure.push(idx)
            }
            Some(ControlKind::LoopRepeat) => self.close_structure(idx, Opcode::LoopStart),
            Some(ControlKind::BranchMerge) => self.close_structure(idx, Opcode::BranchSplit),
            Some(ControlKind::SubReturn) => self.close_structure(idx, Opcode::SubStart),
            _ => {}
        }

        self.session.record_operator(info.name);
        OperatorHandle(Some(idx))
    }

    pub fn set_immediate(&mut self, handle: OperatorHandle, imm: i64) {
        if let Some(op) = self.handle_mut(handle) {
            op.imm = imm;
        }
    }

    pub fn set_addressing(&mut self, handle: OperatorHandle, addressing: Addressing) {
        let Some(idx) = handle.index().filter(|_| !self.dry_run) else {
            return;
        };
        if let Addressing::Static { pool, .. } = addressing {
            match self.constants.get_mut(pool.0 as usize) {
                Some(entry) => entry.refs += 1,
                None => {
                    self.defer(CompileError::internal(format!(
                        "static addressing references missing constant {}",
                        pool.0
                    )));
                    return;
                }
            }
        }
        self.ops[idx.index()].addressing = addressing;
    }

    /// Copy `data` into the arena constant pool and attach it to the operator.
    pub fn attach_constant(&mut self, handle: OperatorHandle, data: &[u8]) -> Option<PoolIdx> {
        let idx = handle.index().filter(|_| !self.dry_run)?;
        let data = match self
            .session
            .charge(size_of::<ConstantEntry<'a>>())
            .and_then(|_| self.session.alloc_slice(data))
        {
            Ok(data) => data,
            Err(err) => {
                self.enter_dry_run(err);
                return None;
            }
        };
        let pool = PoolIdx(self.constants.len() as u32);
        self.constants.push(ConstantEntry { data, refs: 1 });
        self.ops[idx.index()].pool = Some(pool);
        Some(pool)
    }

    /// Mark an operator as externally observable.
    pub fn set_volatile(&mut self, handle: OperatorHandle) {
        if let Some(op) = self.handle_mut(handle) {
            op.flags.insert(OpFlags::VOLATILE);
        }
    }

    /// Point a subroutine call at the subroutine it enters.
    pub fn link_call(&mut self, call: OperatorHandle, sub_start: OperatorHandle) {
        let (Some(call), Some(start)) = (call.index(), sub_start.index()) else {
            return;
        };
        if self.dry_run {
            return;
        }
        if self.ops[call.index()].opcode != Opcode::SubCall
            || self.ops[start.index()].opcode != Opcode::SubStart
        {
            self.defer(CompileError::internal(format!(
                "link_call expects sub_call and sub_start, got {} and {}",
                self.ops[call.index()].opcode.name(),
                self.ops[start.index()].opcode.name()
            )));
            return;
        }
        self.ops[call.index()].linked = Some(start);
    }

    pub fn var_type(&self, var: VarId) -> Option<VarType> {
        self.vars.get(var.index()).filter(|_| var.is_some()).map(|v| v.ty)
    }

    /// Number of variable ids handed out, including the reserved 0.
    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    pub fn operator_count(&self) -> usize {
        self.ops.len()
    }

    pub fn operator(&self, handle: OperatorHandle) -> Option<&Operator> {
        handle.index().and_then(|idx| self.ops.get(idx.index()))
    }

    pub fn operators(&self) -> &[Operator] {
        &self.ops
    }

    pub fn constants(&self) -> &[ConstantEntry<'a>] {
        &self.constants
    }

    pub fn links(&self) -> &LinkTable {
        &self.links
    }

    fn handle_mut(&mut self, handle: OperatorHandle) -> Option<&mut Operator> {
        if self.dry_run {
            return None;
        }
        handle.index().and_then(|idx| self.ops.get_mut(idx.index()))
    }

    fn close_structure(&mut self, idx: OpIdx, opener: Opcode) {
        let closer = self.ops[idx.index()].opcode;
        match self.structure.pop() {
            Some(open) if self.ops[open.index()].opcode == opener => {
                self.ops[open.index()].linked = Some(idx);
                self.ops[idx.index()].linked = Some(open);
            }
            other => {
                let found = other.map_or("nothing", |open| self.ops[open.index()].opcode.name());
                self.defer(CompileError::internal(format!(
                    "{} at {} closes {} instead of {}",
                    closer.name(),
                    idx,
                    found,
                    opener.name()
                )));
            }
        }
    }

    fn enter_dry_run(&mut self, err: CompileError) {
        warn!("emission switched to dry-run mode: {}", err);
        self.dry_run = true;
        self.defer(err);
    }

    fn defer(&mut self, err: CompileError) {
        if self.deferred.is_none() {
            self.deferred = Some(err);
        }
    }

    /// First error recorded during emission, plus any unclosed structure.
    pub(crate) fn emission_error(&mut self) -> Option<CompileError> {
        if let Some(err) = self.deferred.take() {
            return Some(err);
        }
        self.structure.last().map(|open| {
            CompileError::internal(format!(
                "{} at {} is never closed",
                self.ops[open.index()].opcode.name(),
                open
            ))
        })
    }

    /// Append a `Return` unless the program already ends in one.
    pub(crate) fn ensure_return(&mut self) -> CompileResult<()> {
        if self.ops.last().map(|op| op.opcode) != Some(Opcode::Return) {
            self.add_operator(Opcode::Return, VarId::NONE, VarId::NONE, VarId::NONE, VarId::NONE);
            if let Some(err) = self.deferred.take() {
                return Err(err);
            }
        }
        Ok(())
    }

    pub(crate) fn new_var(&mut self, ty: VarType) -> CompileResult<VarId> {
        self.session.charge(size_of::<Variable>())?;
        let id = VarId(self.vars.len() as u32);
        self.vars.push(Variable {
            ty,
            initialized: false,
            producer_head: None,
        });
        Ok(id)
    }

    pub(crate) fn ty(&self, var: VarId) -> VarType {
        self.vars[var.index()].ty
    }

    pub(crate) fn op(&self, idx: OpIdx) -> &Operator {
        &self.ops[idx.index()]
    }

    pub(crate) fn op_mut(&mut self, idx: OpIdx) -> &mut Operator {
        &mut self.ops[idx.index()]
    }

    /// Producers of `var`, newest first.
    pub(crate) fn producers(&self, var: VarId) -> ProducerIter<'_, 'a> {
        ProducerIter {
            program: self,
            next: self.vars.get(var.index()).and_then(|v| v.producer_head),
        }
    }

    #[cfg(test)]
    pub(crate) fn producer_count(&self, var: VarId) -> usize {
        self.producers(var).count()
    }

    /// Nearest producer of `var` strictly before program order `order`.
    pub(crate) fn nearest_producer_before(&self, var: VarId, order: u32) -> Option<OpIdx> {
        self.producers(var).find(|p| self.ops[p.index()].order < order)
    }

    /// Last producer of `var` inside `span`.
    pub(crate) fn last_producer_in_span(&self, var: VarId, span: SpanIdx) -> Option<OpIdx> {
        self.producers(var)
            .skip_while(|p| self.ops[p.index()].span > span)
            .take_while(|p| self.ops[p.index()].span == span)
            .next()
    }

    /// Thread `op` into the producer chain of its result, keeping descending order.
    pub(crate) fn insert_producer(&mut self, op: OpIdx) {
        let var = self.ops[op.index()].result;
        if var.is_none() {
            return;
        }
        let order = self.ops[op.index()].order;
        let mut prev: Option<OpIdx> = None;
        let mut cur = self.vars[var.index()].producer_head;
        while let Some(c) = cur {
            if self.ops[c.index()].order < order {
                break;
            }
            prev = Some(c);
            cur = self.ops[c.index()].next_producer;
        }
        self.ops[op.index()].next_producer = cur;
        match prev {
            Some(p) => self.ops[p.index()].next_producer = Some(op),
            None => self.vars[var.index()].producer_head = Some(op),
        }
    }

    /// Unthread `op` from the producer chain of its result.
    pub(crate) fn remove_producer(&mut self, op: OpIdx) {
        let var = self.ops[op.index()].result;
        if var.is_none() {
            return;
        }
        let next = self.ops[op.index()].next_producer.take();
        if self.vars[var.index()].producer_head == Some(op) {
            self.vars[var.index()].producer_head = next;
            return;
        }
        let mut cur = self.vars[var.index()].producer_head;
        while let Some(c) = cur {
            if self.ops[c.index()].next_producer == Some(op) {
                self.ops[c.index()].next_producer = next;
                return;
            }
            cur = self.ops[c.index()].next_producer;
        }
    }

    /// Retarget the result of `op` to `var`.
    pub(crate) fn set_result(&mut self, op: OpIdx, var: VarId) {
        self.remove_producer(op);
        self.ops[op.index()].result = var;
        self.insert_producer(op);
    }

    /// Link `provider` to operand `slot` of `consumer`, charging new nodes.
    pub(crate) fn link(&mut self, provider: OpIdx, consumer: OpIdx, slot: u8) -> CompileResult<()> {
        if self.links.needs_node() {
            self.session.charge(LINK_SIZE)?;
        }
        self.links.link(provider, consumer, slot);
        Ok(())
    }

    /// Turn `op` into an unlinked `Nop`.
    pub(crate) fn kill(&mut self, op: OpIdx) {
        trace!("kill {} {}", op, self.ops[op.index()].opcode.name());
        self.links.unlink_all(op);
        self.remove_producer(op);
        let node = &mut self.ops[op.index()];
        node.opcode = Opcode::Nop;
        node.result = VarId::NONE;
        node.operands = [VarId::NONE; 3];
        node.addressing = Addressing::Direct;
        node.pool = None;
        node.flags.remove(OpFlags::VOLATILE);
    }

    /// Exchange two operand slots, keeping link slots in step.
    pub(crate) fn swap_operand_slots(&mut self, op: OpIdx, a: u8, b: u8) {
        self.ops[op.index()].operands.swap(a as usize, b as usize);
        for idx in self.links.provider_links(op) {
            let slot = self.links.get(idx).slot;
            if slot == a {
                self.links.set_slot(idx, b);
            } else if slot == b {
                self.links.set_slot(idx, a);
            }
        }
    }

    /// Point operand `slot` of `consumer` at `var`, replacing its providers.
    pub(crate) fn rewire_operand(
        &mut self,
        consumer: OpIdx,
        slot: u8,
        var: VarId,
        providers: &[OpIdx],
    ) -> CompileResult<()> {
        for idx in self.links.provider_links(consumer) {
            if self.links.get(idx).slot == slot {
                self.links.unlink(idx);
            }
        }
        self.ops[consumer.index()].operands[slot as usize] = var;
        for provider in providers {
            self.link(*provider, consumer, slot)?;
        }
        Ok(())
    }
}

/// Iterator over a producer chain.
pub(crate) struct ProducerIter<'p, 'a> {
    program: &'p Program<'a>,
    next: Option<OpIdx>,
}

impl Iterator for ProducerIter<'_, '_> {
    type Item = OpIdx;

    fn next(&mut self) -> Option<OpIdx> {
        let idx = self.next?;
        self.next = self.program.ops[idx.index()].next_producer;
        Some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bumpalo::Bump;

    #[test]
    fn test_alloc_var_monotonic() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut program = Program::new(&session);

        let a = program.alloc_var(VarType::I32);
        let b = program.alloc_var(VarType::V128);
        assert_eq!(a, VarId(1));
        assert_eq!(b, VarId(2));
        assert_eq!(program.var_type(b), Some(VarType::V128));
        assert_eq!(program.var_type(VarId::NONE), None);
    }

    #[test]
    fn test_producer_chain_order() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut program = Program::new(&session);

        let x = program.alloc_var(VarType::I64);
        let n = VarId::NONE;
        program.add_operator(Opcode::Const, x, n, n, n);
        program.add_operator(Opcode::Add, x, x, x, n);
        program.add_operator(Opcode::Add, x, x, x, n);

        let chain: Vec<_> = program.producers(x).collect();
        assert_eq!(chain, vec![OpIdx(2), OpIdx(1), OpIdx(0)]);
        assert_eq!(program.nearest_producer_before(x, 2), Some(OpIdx(1)));
        assert_eq!(program.nearest_producer_before(x, 0), None);

        program.remove_producer(OpIdx(1));
        assert_eq!(program.producers(x).collect::<Vec<_>>(), vec![OpIdx(2), OpIdx(0)]);
        program.ops[1].result = x;
        program.insert_producer(OpIdx(1));
        assert_eq!(program.producer_count(x), 3);
        assert_eq!(program.producers(x).nth(1), Some(OpIdx(1)));
    }

    #[test]
    fn test_structure_linking() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut program = Program::new(&session);
        let n = VarId::NONE;

        let c = program.alloc_var(VarType::I32);
        program.add_operator(Opcode::Const, c, n, n, n);
        let start = program.add_operator(Opcode::LoopStart, n, n, n, n);
        let split = program.add_operator(Opcode::BranchSplit, n, c, n, n);
        let merge = program.add_operator(Opcode::BranchMerge, n, n, n, n);
        let repeat = program.add_operator(Opcode::LoopRepeat, n, c, n, n);

        assert_eq!(program.operator(start).unwrap().linked, repeat.index());
        assert_eq!(program.operator(repeat).unwrap().linked, start.index());
        assert_eq!(program.operator(split).unwrap().linked, merge.index());
        assert!(program.emission_error().is_none());
    }

    #[test]
    fn test_unbalanced_structure_is_deferred() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut program = Program::new(&session);
        let n = VarId::NONE;

        program.add_operator(Opcode::LoopStart, n, n, n, n);
        program.add_operator(Opcode::BranchMerge, n, n, n, n);
        assert!(matches!(
            program.emission_error(),
            Some(CompileError::InternalInconsistency { .. })
        ));
    }

    #[test]
    fn test_dry_run_after_out_of_memory() {
        let arena = Bump::new();
        let session = CompilationSession::with_memory_limit(&arena, 256);
        let mut program = Program::new(&session);
        let n = VarId::NONE;

        let x = program.alloc_var(VarType::I64);
        let mut last = OperatorHandle::NONE;
        for _ in 0..64 {
            last = program.add_operator(Opcode::Const, x, n, n, n);
        }
        assert!(program.is_dry_run());
        assert!(last.is_none());
        assert_eq!(program.alloc_var(VarType::I32), VarId::NONE);
        // Attachments on a dead handle are ignored.
        program.set_immediate(last, 5);
        assert!(matches!(
            program.emission_error(),
            Some(CompileError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_constant_refs() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut program = Program::new(&session);
        let n = VarId::NONE;

        let p = program.alloc_var(VarType::Ptr);
        let h = program.add_operator(Opcode::StaticAddr, p, n, n, n);
        let pool = program.attach_constant(h, &[0xff; 16]).unwrap();
        assert_eq!(program.constants()[pool.0 as usize].refs, 1);
        assert_eq!(program.constants()[pool.0 as usize].data.len(), 16);

        let v = program.alloc_var(VarType::V128);
        let load = program.add_operator(Opcode::VecLoad128, v, n, n, n);
        program.set_addressing(load, Addressing::Static { pool, disp: 0 });
        assert_eq!(program.constants()[pool.0 as usize].refs, 2);
    }
}
