// This module replays a mapped program against a simple model of the machine and rejects any
// mapping under which an operator would read the wrong value. The model tracks, per register,
// which variable it holds, which variables have a current frame slot, and which variables are
// defined on every path to the current point. Shuffles and operators are applied in encoder order.
// Loops are replayed twice: once from the entry state and once from the meet of the entry state
// and the state the back edge produces, so a body that relies on a register or a frame slot the
// back edge does not restore fails in the second pass. Branches replay the taken path and meet it
// with the bypass state at the merge. Variables that are not defined on every path are not
// checked, since reading them is the front end's business.

//! Replay checker for register mappings.

use super::mapper::{OperatorMapping, Shuffle};
use crate::analysis::SpanGraph;
use crate::core::error::{CompileError, CompileResult};
use crate::core::register_file::{PhysReg, MAX_REGISTERS};
use crate::core::var_set::VarSet;
use crate::ir::{ControlKind, OpIdx, Operator, SpanIdx, VarId};
use log::debug;

#[derive(Debug, Clone)]
struct Machine {
    regs: [Option<VarId>; MAX_REGISTERS],
    mem: VarSet,
    defined: VarSet,
}

impl Machine {
    fn empty() -> Self {
        Self {
            regs: [None; MAX_REGISTERS],
            mem: VarSet::new(),
            defined: VarSet::new(),
        }
    }

    fn holds(&self, reg: PhysReg, var: VarId) -> bool {
        self.regs[reg.slot()] == Some(var)
    }

    fn in_register(&self, var: VarId) -> bool {
        self.regs.contains(&Some(var))
    }

    /// What both states agree on.
    fn meet(&self, other: &Machine) -> Machine {
        let mut regs = [None; MAX_REGISTERS];
        for (slot, reg) in regs.iter_mut().enumerate() {
            if self.regs[slot] == other.regs[slot] {
                *reg = self.regs[slot];
            }
        }
        let mut mem = self.mem.clone();
        mem.intersect_with(&other.mem);
        let mut defined = self.defined.clone();
        defined.intersect_with(&other.defined);
        Machine { regs, mem, defined }
    }
}

/// Replay `mappings` over `ops` and report the first inconsistency.
pub fn verify(ops: &[Operator], mappings: &[OperatorMapping], graph: &SpanGraph) -> CompileResult<()> {
    if ops.len() != mappings.len() {
        return Err(CompileError::internal(format!(
            "{} operators but {} mappings",
            ops.len(),
            mappings.len()
        )));
    }
    let checker = Checker {
        ops,
        mappings,
        graph,
    };
    let mut machine = Machine::empty();
    checker.replay(&mut machine, 0, ops.len())?;
    debug!("checker: {} operators replayed", ops.len());
    Ok(())
}

struct Checker<'c> {
    ops: &'c [Operator],
    mappings: &'c [OperatorMapping],
    graph: &'c SpanGraph,
}

fn fail(at: usize, what: String) -> CompileError {
    CompileError::internal(format!("mapping of #{}: {}", at, what))
}

impl Checker<'_> {
    fn replay(&self, machine: &mut Machine, from: usize, to: usize) -> CompileResult<()> {
        let mut i = from;
        while i < to {
            let op = &self.ops[i];
            match op.info().control {
                Some(ControlKind::LoopStart) => {
                    let repeat = self.partner(i)?;
                    self.step(machine, i)?;
                    self.replay_loop(machine, i, repeat)?;
                    i = repeat + 1;
                }
                Some(ControlKind::BranchSplit) => {
                    let merge = self.partner(i)?;
                    self.step(machine, i)?;
                    let bypass = machine.clone();
                    self.replay(machine, i + 1, merge)?;
                    self.step(machine, merge)?;
                    self.converge(machine, &bypass, merge)?;
                    *machine = machine.meet(&bypass);
                    i = merge + 1;
                }
                _ => {
                    self.step(machine, i)?;
                    i += 1;
                }
            }
        }
        Ok(())
    }

    fn partner(&self, i: usize) -> CompileResult<usize> {
        match self.ops[i].linked {
            Some(OpIdx(p)) if p as usize > i && (p as usize) < self.ops.len() => Ok(p as usize),
            _ => Err(fail(i, "structure has no later partner".into())),
        }
    }

    fn body_span(&self, start: usize) -> SpanIdx {
        SpanIdx(self.ops[start].span.0 + 1)
    }

    fn replay_loop(&self, machine: &mut Machine, start: usize, repeat: usize) -> CompileResult<()> {
        let live = &self.graph.span(self.body_span(start)).used_before;
        let entry = machine.clone();

        self.replay(machine, start + 1, repeat)?;
        self.step(machine, repeat)?;
        let first_exit = machine.clone();
        let mut back = machine.clone();
        for shuffle in &self.mappings[repeat].back_edge {
            self.shuffle(&mut back, repeat, shuffle)?;
        }
        self.loop_closes(&entry, &back, live, repeat)?;

        *machine = entry.meet(&back);
        self.replay(machine, start + 1, repeat)?;
        self.step(machine, repeat)?;
        let mut back = machine.clone();
        for shuffle in &self.mappings[repeat].back_edge {
            self.shuffle(&mut back, repeat, shuffle)?;
        }
        self.loop_closes(&entry, &back, live, repeat)?;

        *machine = first_exit.meet(machine);
        Ok(())
    }

    /// Every live value the body finds in registers at its start is back in at least one of those
    /// registers after the back edge. A register left holding a copy by a move may lose it; the
    /// second pass starts from the meet and rejects any read of such a copy.
    fn loop_closes(&self, entry: &Machine, back: &Machine, live: &VarSet, at: usize) -> CompileResult<()> {
        for (slot, var) in entry.regs.iter().enumerate() {
            let Some(var) = *var else {
                continue;
            };
            if !live.contains(var) || !entry.defined.contains(var) || !back.defined.contains(var) {
                continue;
            }
            let restored = (0..MAX_REGISTERS)
                .any(|other| entry.regs[other] == Some(var) && back.regs[other] == Some(var));
            if !restored {
                return Err(fail(
                    at,
                    format!(
                        "back edge leaves {} out of {}",
                        var,
                        PhysReg::from_slot(slot)
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Both paths into the span after `merge` agree on where each live value is.
    fn converge(&self, taken: &Machine, bypass: &Machine, merge: usize) -> CompileResult<()> {
        let after = SpanIdx(self.ops[merge].span.0 + 1);
        if after.index() >= self.graph.len() {
            return Err(fail(merge, "merge ends the program".into()));
        }
        for var in self.graph.span(after).used_before.iter() {
            if !taken.defined.contains(var) || !bypass.defined.contains(var) {
                continue;
            }
            let shared = (0..MAX_REGISTERS)
                .any(|slot| taken.regs[slot] == Some(var) && bypass.regs[slot] == Some(var));
            if !shared && !(taken.mem.contains(var) && bypass.mem.contains(var)) {
                return Err(fail(merge, format!("paths disagree on {}", var)));
            }
        }
        Ok(())
    }

    fn enter_span(&self, machine: &mut Machine, i: usize) {
        let span = self.graph.span(self.ops[i].span);
        if span.first as usize != i || i == 0 {
            return;
        }
        let previous = self.ops[i - 1].info().control;
        if matches!(
            previous,
            Some(
                ControlKind::Return
                    | ControlKind::SubCall
                    | ControlKind::SubReturn
                    | ControlKind::SubStart
            )
        ) {
            machine.regs = [None; MAX_REGISTERS];
            machine.mem = span.used_before.clone();
            machine.defined = span.used_before.clone();
        }
    }

    fn step(&self, machine: &mut Machine, i: usize) -> CompileResult<()> {
        self.enter_span(machine, i);
        let op = &self.ops[i];
        let mapping = &self.mappings[i];

        for shuffle in &mapping.before {
            self.shuffle(machine, i, shuffle)?;
        }

        for (slot, var) in op.operand_slots() {
            let reg = mapping.operands[slot]
                .ok_or_else(|| fail(i, format!("operand {} has no register", slot)))?;
            if machine.defined.contains(var) && !machine.holds(reg, var) {
                return Err(fail(
                    i,
                    format!(
                        "operand {} expects {} in {}, found {:?}",
                        slot,
                        var,
                        reg,
                        machine.regs[reg.slot()]
                    ),
                ));
            }
        }

        for reg in mapping.clobbers.iter() {
            machine.regs[reg.slot()] = None;
        }
        let result = if op.info().has_result { op.result } else { VarId::NONE };
        if result.is_some() {
            let reg = mapping
                .result
                .ok_or_else(|| fail(i, "result has no register".into()))?;
            for held in machine.regs.iter_mut() {
                if *held == Some(result) {
                    *held = None;
                }
            }
            machine.regs[reg.slot()] = Some(result);
            machine.mem.remove(result);
            machine.defined.insert(result);
        }

        let span = self.graph.span(op.span);
        if span.last as usize == i {
            let flushes = matches!(
                op.info().control,
                Some(ControlKind::SubCall | ControlKind::SubReturn)
            );
            for var in span.used_after.iter() {
                if !machine.defined.contains(var) {
                    continue;
                }
                let kept = if flushes {
                    machine.mem.contains(var)
                } else {
                    machine.mem.contains(var) || machine.in_register(var)
                };
                if !kept {
                    return Err(fail(i, format!("{} is lost at the end of its span", var)));
                }
            }
        }
        Ok(())
    }

    fn shuffle(&self, machine: &mut Machine, i: usize, shuffle: &Shuffle) -> CompileResult<()> {
        match *shuffle {
            Shuffle::Save { var, reg, .. } => {
                if machine.holds(reg, var) {
                    machine.mem.insert(var);
                } else if machine.defined.contains(var) {
                    return Err(fail(i, format!("save of {} from {} which holds something else", var, reg)));
                }
            }
            Shuffle::Load { var, reg, .. } => {
                if machine.defined.contains(var) && !machine.mem.contains(var) {
                    return Err(fail(i, format!("load of {} from a stale slot", var)));
                }
                machine.regs[reg.slot()] = Some(var);
            }
            Shuffle::Move { var, from, to, .. } => {
                if machine.defined.contains(var) && !machine.holds(from, var) {
                    return Err(fail(i, format!("move of {} from {} which holds something else", var, from)));
                }
                machine.regs[to.slot()] = machine.regs[from.slot()];
            }
            Shuffle::Swap { a, b } => machine.regs.swap(a.slot(), b.slot()),
        }
        Ok(())
    }
}
