// This module assigns physical registers to every operand and result in one pass over the
// operators in program order. The register state says which variable occupies which register
// and whether that variable's frame slot is also current. Consumer counts from the instruction
// graph tell when a value dies: an operand whose source instruction reaches zero remaining
// consumers releases its registers after the operator. Free registers come from the per-class
// rotation; when none is free the occupant whose next read is furthest away (usage table) is
// evicted, saving it first when its memory copy is stale. Such a save is attached to the
// outermost enclosing loop start or branch split whose entry state had the same variable in the
// same register and that has not written the register since, so it runs once outside the body.
//
// Control operators shape the state. LoopStart snapshots the state the body is entered with and
// LoopRepeat plans the back-edge shuffles that restore it. BranchSplit snapshots the bypass state
// and BranchMerge turns the taken path's state into it. Calls, subroutine entry and returns
// flush every live register to memory and start over with an empty register file.

//! Register mapper.

pub mod context;
pub mod shuffle;

pub use context::{ContextKind, ContextStack, MapContext};
pub use shuffle::{Shuffle, ShufflePlanner};

use crate::analysis::{SpanGraph, UsageTable};
use crate::codegen::instruction_graph::InstructionGraph;
use crate::core::error::{CompileError, CompileResult};
use crate::core::options::CompileOptions;
use crate::core::register_file::{PhysReg, RegBitSet, RegClass, RegState, RegisterFile};
use crate::core::var_set::VarSet;
use crate::ir::{ClassReq, ControlKind, OpIdx, Program, SpanIdx, VarId};
use log::{debug, trace};
use std::mem;

/// Registers and shuffles chosen for one operator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperatorMapping {
    pub result: Option<PhysReg>,
    pub operands: [Option<PhysReg>; 3],
    /// The result overwrites operand 2's register instead of operand 1's.
    pub commuted: bool,
    /// Executed before the operator.
    pub before: Vec<Shuffle>,
    /// Executed only when a `LoopRepeat` jumps back.
    pub back_edge: Vec<Shuffle>,
    /// Registers the operator destroys besides its result.
    pub clobbers: RegBitSet,
}

/// Output of the mapper.
#[derive(Debug, Clone, Default)]
pub struct RegisterMap {
    /// One entry per operator.
    pub mappings: Vec<OperatorMapping>,
    /// Variables that are saved or loaded somewhere and need a frame slot.
    pub saved: VarSet,
}

#[derive(Debug, Default)]
struct Counters {
    saves: usize,
    loads: usize,
    moves: usize,
    swaps: usize,
    hoisted: usize,
}

/// Map every operator of `program` onto the x86-64 register file.
pub fn map_registers(
    program: &Program<'_>,
    graph: &SpanGraph,
    insts: &InstructionGraph,
    usage: &UsageTable,
    options: &CompileOptions,
) -> CompileResult<RegisterMap> {
    let regs = RegisterFile::new(options.allow_frame_pointer_register);
    let planner = ShufflePlanner::new(
        program,
        regs.allocatable(),
        options.enable_memory_shuffling,
        options.avoid_narrow_moves,
    );
    let mut mapper = Mapper {
        program,
        graph,
        insts,
        usage,
        options,
        planner,
        regs,
        state: RegState::new(),
        remaining: insts.consumer_counts(),
        saved: VarSet::with_capacity(program.var_count()),
        contexts: ContextStack::new(),
        mappings: Vec::with_capacity(program.operator_count()),
        pending: Vec::new(),
        cursor: (0, SpanIdx(0)),
        counters: Counters::default(),
    };
    mapper.run()?;

    let Mapper {
        mappings,
        saved,
        counters,
        ..
    } = mapper;
    debug!(
        "mapper: {} operators, {} saves ({} hoisted), {} loads, {} moves, {} swaps",
        mappings.len(),
        counters.saves,
        counters.hoisted,
        counters.loads,
        counters.moves,
        counters.swaps
    );
    program.session().record(|stats| {
        stats.saves += counters.saves;
        stats.loads += counters.loads;
        stats.moves += counters.moves;
        stats.swaps += counters.swaps;
        stats.hoisted_saves += counters.hoisted;
    });
    Ok(RegisterMap { mappings, saved })
}

struct Mapper<'m, 'a> {
    program: &'m Program<'a>,
    graph: &'m SpanGraph,
    insts: &'m InstructionGraph,
    usage: &'m UsageTable,
    options: &'m CompileOptions,
    planner: ShufflePlanner<'m, 'a>,
    regs: RegisterFile,
    state: RegState,
    /// Live consumers left per instruction.
    remaining: Vec<u32>,
    saved: VarSet,
    contexts: ContextStack,
    mappings: Vec<OperatorMapping>,
    /// Shuffles for the operator being mapped.
    pending: Vec<Shuffle>,
    /// Order and span of the operator being mapped.
    cursor: (u32, SpanIdx),
    counters: Counters,
}

fn class_matches(req: ClassReq, class: RegClass) -> bool {
    match req {
        ClassReq::None => false,
        ClassReq::Any => true,
        ClassReq::Gp => class == RegClass::Gp,
        ClassReq::Vec => class == RegClass::Vec,
    }
}

impl Mapper<'_, '_> {
    fn run(&mut self) -> CompileResult<()> {
        let program = self.program;
        let graph = self.graph;
        for (i, op) in program.operators().iter().enumerate() {
            let idx = OpIdx(i as u32);
            if graph.span(op.span).first == op.order {
                let live = &graph.span(op.span).used_before;
                self.state.retain(|var| live.contains(var));
            }
            match op.info().control {
                None => self.map_operator(idx)?,
                Some(kind) => self.map_control(idx, kind)?,
            }
        }
        if let Some(open) = self.contexts.last() {
            return Err(CompileError::internal(format!(
                "{} at {} is never closed",
                program.op(open.anchor).opcode.name(),
                open.anchor
            )));
        }
        Ok(())
    }

    fn map_control(&mut self, idx: OpIdx, kind: ControlKind) -> CompileResult<()> {
        let graph = self.graph;
        let span = self.program.op(idx).span;
        match kind {
            ControlKind::Boundary => self.map_operator(idx),
            ControlKind::SubCall
            | ControlKind::SubStart
            | ControlKind::SubReturn
            | ControlKind::Return => {
                self.flush(span);
                self.map_operator(idx)?;
                self.contexts.touch_all(self.regs.allocatable());
                self.state.clear_all();
                Ok(())
            }
            ControlKind::LoopStart => {
                self.map_operator(idx)?;
                let live = &graph.span(self.next_span(span)?).used_before;
                self.state.retain(|var| live.contains(var));
                self.contexts
                    .push(ContextKind::Loop, idx, self.state.clone());
                Ok(())
            }
            ControlKind::LoopRepeat => {
                self.map_operator(idx)?;
                let ctx = self.close(ContextKind::Loop, idx)?;
                let body = self.next_span(self.program.op(ctx.anchor).span)?;
                let live = &graph.span(body).used_before;
                let mut current = self.state.clone();
                current.retain(|var| live.contains(var));
                let shuffles = self.equalize(idx, &mut current, &ctx.entry)?;
                self.mappings[idx.index()].back_edge = shuffles;
                Ok(())
            }
            ControlKind::BranchSplit => {
                self.map_operator(idx)?;
                self.contexts
                    .push(ContextKind::Branch, idx, self.state.clone());
                Ok(())
            }
            ControlKind::BranchMerge => {
                self.map_operator(idx)?;
                let ctx = self.close(ContextKind::Branch, idx)?;
                let live = &graph.span(self.next_span(span)?).used_before;
                let mut target = ctx.entry;
                target.retain(|var| live.contains(var));
                let mut current = mem::take(&mut self.state);
                current.retain(|var| live.contains(var));
                let shuffles = self.equalize(idx, &mut current, &target)?;
                self.mappings[idx.index()].before.extend(shuffles);
                self.state = current;
                Ok(())
            }
        }
    }

    fn next_span(&self, span: SpanIdx) -> CompileResult<SpanIdx> {
        let next = SpanIdx(span.0 + 1);
        if next.index() < self.graph.len() {
            Ok(next)
        } else {
            Err(CompileError::internal(format!("no span follows {}", span)))
        }
    }

    fn close(&mut self, kind: ContextKind, closer: OpIdx) -> CompileResult<MapContext> {
        let ctx = self.contexts.pop().ok_or_else(|| {
            CompileError::internal(format!("{} closes nothing", closer))
        })?;
        if ctx.kind != kind || self.program.op(closer).linked != Some(ctx.anchor) {
            return Err(CompileError::internal(format!(
                "{} does not close {:?} context at {}",
                closer, ctx.kind, ctx.anchor
            )));
        }
        Ok(ctx)
    }

    /// Shuffles turning `current` into `target` at `at`.
    fn equalize(
        &mut self,
        at: OpIdx,
        current: &mut RegState,
        target: &RegState,
    ) -> CompileResult<Vec<Shuffle>> {
        let shuffles = self.planner.plan(current, target);
        if !shuffles.is_empty() && !self.options.enable_shuffling {
            return Err(CompileError::internal(format!(
                "register states diverge at {} and shuffling is disabled",
                at
            )));
        }
        for shuffle in &shuffles {
            self.contexts.touch_all(shuffle.writes());
            match *shuffle {
                Shuffle::Save { var, .. } => {
                    self.saved.insert(var);
                    self.counters.saves += 1;
                }
                Shuffle::Load { var, .. } => {
                    self.saved.insert(var);
                    self.counters.loads += 1;
                }
                Shuffle::Move { .. } => self.counters.moves += 1,
                Shuffle::Swap { .. } => self.counters.swaps += 1,
            }
        }
        Ok(shuffles)
    }

    /// Make sure every value leaving `span` is current in memory.
    fn flush(&mut self, span: SpanIdx) {
        let graph = self.graph;
        let live = &graph.span(span).used_after;
        let occupied: Vec<_> = self.state.occupied().collect();
        for (reg, var) in occupied {
            if live.contains(var) && !self.state.is_in_memory(reg) {
                self.save(reg, var);
            }
        }
    }

    fn holders(&self, var: VarId) -> RegBitSet {
        let mut set = RegBitSet::EMPTY;
        for (reg, occupant) in self.state.occupied() {
            if occupant == var {
                set.insert(reg);
            }
        }
        set
    }

    fn release(&mut self, var: VarId) {
        for reg in self.holders(var).iter() {
            self.state.clear(reg);
        }
    }

    /// Store `var` from `reg`, at the outermost anchor that allows it.
    fn save(&mut self, reg: PhysReg, var: VarId) {
        let width = self.planner.slot_width(var);
        match self.contexts.eviction_site(reg, var) {
            Some(depth) => {
                let anchor = self.contexts.anchor(depth);
                trace!("save {} from {} hoisted to {}", var, reg, anchor);
                self.mappings[anchor.index()].before.push(Shuffle::Save {
                    var,
                    reg,
                    width,
                    hoisted: true,
                });
                self.contexts.mark_saved(depth, reg, var);
                self.counters.hoisted += 1;
            }
            None => self.pending.push(self.planner.save(var, reg)),
        }
        for holder in self.holders(var).iter() {
            self.state.set_in_memory(holder, true);
        }
        self.saved.insert(var);
        self.counters.saves += 1;
    }

    fn load(&mut self, var: VarId, reg: PhysReg) {
        self.pending.push(self.planner.load(var, reg));
        self.state.assign(reg, var, true);
        self.contexts.touch(reg);
        self.saved.insert(var);
        self.counters.loads += 1;
    }

    /// Copy `var` into `to`, keeping the source register.
    fn copy(&mut self, var: VarId, from: PhysReg, to: PhysReg) {
        self.pending.push(self.planner.mov(var, from, to));
        let in_memory = self.state.is_in_memory(from);
        self.state.assign(to, var, in_memory);
        self.contexts.touch(to);
        self.counters.moves += 1;
    }

    fn relocate(&mut self, var: VarId, from: PhysReg, to: PhysReg) {
        self.copy(var, from, to);
        self.state.clear(from);
    }

    /// Empty `reg`, saving its occupant if that was the only current copy.
    fn evict(&mut self, reg: PhysReg) {
        let Some(var) = self.state.occupant(reg) else {
            return;
        };
        let copies = self.holders(var).count();
        if copies == 1 && !self.state.is_in_memory(reg) {
            self.save(reg, var);
        }
        self.state.clear(reg);
    }

    /// Free register of `class` outside `exclude`, without evicting.
    fn take_free(&mut self, class: RegClass, exclude: RegBitSet) -> Option<PhysReg> {
        let free = self
            .regs
            .allocatable()
            .difference(self.state.occupied_set())
            .difference(exclude);
        let reg = self.regs.next_in_rotation(class, free)?;
        self.regs.advance(reg);
        Some(reg)
    }

    /// A register of `class` outside `exclude`, evicting if necessary.
    fn alloc_reg(&mut self, class: RegClass, exclude: RegBitSet) -> CompileResult<PhysReg> {
        if let Some(reg) = self.take_free(class, exclude) {
            return Ok(reg);
        }

        let (order, span) = self.cursor;
        let mut victim: Option<(PhysReg, u32)> = None;
        for reg in self.regs.rotation(class) {
            if exclude.contains(reg) {
                continue;
            }
            let Some(var) = self.state.occupant(reg) else {
                continue;
            };
            let distance = self
                .usage
                .distance_to_consumer(var, order, span, self.graph)
                .unwrap_or(u32::MAX);
            if victim.map_or(true, |(_, best)| distance > best) {
                victim = Some((reg, distance));
            }
        }
        let (reg, distance) = victim.ok_or_else(|| {
            CompileError::internal(format!("no {:?} register left at #{}", class, order))
        })?;
        trace!(
            "evict {:?} from {} (next read in {})",
            self.state.occupant(reg),
            reg,
            distance
        );
        self.evict(reg);
        self.regs.advance(reg);
        Ok(reg)
    }

    fn map_operator(&mut self, idx: OpIdx) -> CompileResult<()> {
        let program = self.program;
        let op = program.op(idx);
        let info = op.info();
        if op.is_nop() {
            return Err(CompileError::UnsupportedOperation { opcode: op.opcode });
        }
        self.cursor = (op.order, op.span);

        for (slot, var) in op.operand_slots() {
            if !class_matches(info.operand_class[slot], program.ty(var).class()) {
                return Err(CompileError::UnsupportedOperation { opcode: op.opcode });
            }
        }
        let result = if info.has_result { op.result } else { VarId::NONE };
        if result.is_some() && !class_matches(info.result_class, program.ty(result).class()) {
            return Err(CompileError::UnsupportedOperation { opcode: op.opcode });
        }

        // Deaths.
        let mut dying: Vec<VarId> = Vec::new();
        for (slot, var) in op.operand_slots() {
            let source = self.insts.source(idx, slot as u8).ok_or_else(|| {
                CompileError::internal(format!("operand {} of {} has no source", slot, idx))
            })?;
            let count = &mut self.remaining[source.index()];
            *count = count.checked_sub(1).ok_or_else(|| {
                CompileError::internal(format!("{} consumed more often than counted", source))
            })?;
            if (*count == 0 || var == result) && !dying.contains(&var) {
                dying.push(var);
            }
        }

        let fixed = op.opcode.fixed_regs();
        let reserved = fixed.reserved().intersect(self.regs.allocatable());
        let mut fixed_operands = RegBitSet::EMPTY;
        for reg in fixed.operands.iter().flatten() {
            fixed_operands.insert(*reg);
        }

        // Clear the registers the opcode pins or destroys.
        for reg in reserved.iter() {
            let Some(var) = self.state.occupant(reg) else {
                continue;
            };
            let in_place = (0..3).any(|s| fixed.operands[s] == Some(reg) && op.operands[s] == var);
            if in_place {
                continue;
            }
            if !self.holders(var).difference(reserved).is_empty() {
                self.state.clear(reg);
            } else if let Some(to) = self.take_free(reg.class, reserved) {
                self.relocate(var, reg, to);
            } else {
                self.evict(reg);
            }
        }

        let mut operand_regs: [Option<PhysReg>; 3] = [None; 3];
        let mut placed = RegBitSet::EMPTY;

        for slot in 0..3 {
            let (Some(reg), var) = (fixed.operands[slot], op.operands[slot]) else {
                continue;
            };
            if var.is_none() {
                continue;
            }
            if self.state.occupant(reg) != Some(var) {
                let holders = self.holders(var);
                match holders.iter().next() {
                    Some(from) if fixed_operands.contains(from) => self.copy(var, from, reg),
                    Some(from) => self.relocate(var, from, reg),
                    None => self.load(var, reg),
                }
            }
            operand_regs[slot] = Some(reg);
            placed.insert(reg);
        }

        for (slot, var) in op.operand_slots() {
            if operand_regs[slot].is_some() {
                continue;
            }
            let holders = self.holders(var);
            let usable = holders
                .difference(reserved)
                .union(holders.intersect(fixed_operands));
            let reg = match usable.iter().next() {
                Some(reg) => reg,
                None => {
                    let exclude = reserved.union(placed).union(self.operand_homes(idx));
                    let reg = self.alloc_reg(program.ty(var).class(), exclude)?;
                    match holders.iter().next() {
                        Some(from) => self.copy(var, from, reg),
                        None => self.load(var, reg),
                    }
                    reg
                }
            };
            operand_regs[slot] = Some(reg);
            placed.insert(reg);
        }

        // Result register.
        let mut commuted = false;
        let destructive = info.destructive
            && !(self.options.use_extended_simd_isa && info.result_class == ClassReq::Vec);
        let result_reg = if result.is_none() {
            None
        } else if let Some(reg) = fixed.result {
            Some(reg)
        } else if destructive {
            let first = operand_regs[0].ok_or_else(|| {
                CompileError::internal(format!("{} has no first operand", idx))
            })?;
            let second = op.operands[1];
            if !dying.contains(&op.operands[0])
                && info.commutative
                && second.is_some()
                && second != op.operands[0]
                && dying.contains(&second)
            {
                commuted = true;
                operand_regs[1]
            } else {
                Some(first)
            }
        } else {
            let class = program.ty(result).class();
            let reuse = op.operand_slots().find_map(|(slot, var)| {
                let reg = operand_regs[slot]?;
                (dying.contains(&var) && reg.class == class && !reserved.contains(reg))
                    .then_some(reg)
            });
            match reuse {
                Some(reg) => Some(reg),
                None => {
                    let exclude = reserved.union(placed).union(self.operand_homes(idx));
                    Some(self.alloc_reg(class, exclude)?)
                }
            }
        };

        // Keep live operands whose every copy is about to be destroyed.
        let mut written = fixed.clobbers;
        if let Some(reg) = fixed.result {
            written.insert(reg);
        }
        let mut destroyed = written;
        if let Some(reg) = result_reg {
            destroyed.insert(reg);
        }
        let mut preserved: Vec<VarId> = Vec::new();
        for (_, var) in op.operand_slots() {
            if dying.contains(&var) || preserved.contains(&var) {
                continue;
            }
            preserved.push(var);
            let holders = self.holders(var);
            let Some(from) = holders.iter().next() else {
                continue;
            };
            if !holders.difference(destroyed).is_empty() {
                continue;
            }
            match self.take_free(from.class, destroyed.union(reserved)) {
                Some(to) => self.copy(var, from, to),
                None => {
                    if !holders.iter().any(|reg| self.state.is_in_memory(reg)) {
                        self.save(from, var);
                    }
                }
            }
        }

        for reg in written.iter() {
            self.state.clear(reg);
        }
        self.contexts.touch_all(written);
        for var in &dying {
            self.release(*var);
        }
        if let Some(reg) = result_reg {
            self.release(result);
            self.state.clear(reg);
            self.state.assign(reg, result, false);
            self.contexts.touch(reg);
            if self.remaining[idx.index()] == 0 {
                self.state.clear(reg);
            }
        }

        trace!(
            "map {} {}: result {:?}, operands {:?}",
            idx,
            op.opcode.name(),
            result_reg,
            operand_regs
        );
        debug_assert_eq!(self.mappings.len(), idx.index());
        self.mappings.push(OperatorMapping {
            result: result_reg,
            operands: operand_regs,
            commuted,
            before: mem::take(&mut self.pending),
            back_edge: Vec::new(),
            clobbers: fixed.clobbers,
        });
        Ok(())
    }

    /// Registers currently holding an operand of `idx`.
    fn operand_homes(&self, idx: OpIdx) -> RegBitSet {
        let op = self.program.op(idx);
        let mut set = RegBitSet::EMPTY;
        for (reg, var) in self.state.occupied() {
            if op.reads(var) {
                set.insert(reg);
            }
        }
        set
    }
}
