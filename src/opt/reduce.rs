//! Peephole reducer.
//!
//! One rough pass visits every operator in program order; any rewrite puts
//! the operators it touched on a FIFO rethink queue, which is drained until
//! empty. Every rule either deletes an operator, removes an operand, or
//! turns the matched shape into one the same rule no longer matches, so the
//! queue runs dry.

use crate::analysis::SpanGraph;
use crate::core::error::CompileResult;
use crate::ir::{Addressing, OpFlags, OpIdx, Opcode, Operator, Program, VarId};
use log::{debug, trace};
use std::collections::VecDeque;

/// Rewrite `program` until no rule applies; returns the number of rewrites.
pub fn reduce(program: &mut Program<'_>, graph: &SpanGraph) -> CompileResult<usize> {
    let mut reducer = Reducer {
        program,
        graph,
        queue: VecDeque::new(),
        rewrites: 0,
    };
    reducer.run()?;
    let rewrites = reducer.rewrites;
    debug!("reduce: {} rewrites", rewrites);
    reducer
        .program
        .session()
        .record(|stats| stats.rewrites += rewrites);
    Ok(rewrites)
}

struct Reducer<'p, 'a> {
    program: &'p mut Program<'a>,
    graph: &'p SpanGraph,
    queue: VecDeque<OpIdx>,
    rewrites: usize,
}

impl Reducer<'_, '_> {
    fn run(&mut self) -> CompileResult<()> {
        for i in 0..self.program.ops.len() {
            self.think(OpIdx(i as u32))?;
        }
        while let Some(op) = self.queue.pop_front() {
            self.program.op_mut(op).flags.remove(OpFlags::RETHINK);
            self.think(op)?;
        }
        Ok(())
    }

    fn think(&mut self, op: OpIdx) -> CompileResult<bool> {
        let opcode = self.program.op(op).opcode;
        let fired = match opcode {
            Opcode::Mov => self.elide_upward(op)? || self.elide_downward(op)?,
            Opcode::Load32 => self.combine_load(op)? || self.fold_address(op)?,
            Opcode::Not | Opcode::VecNot => self.and_not(op),
            _ if opcode.is_memory() => self.fold_address(op)?,
            _ => false,
        };
        if fired {
            self.rewrites += 1;
        }
        Ok(fired)
    }

    fn requeue(&mut self, op: OpIdx) {
        let node = self.program.op_mut(op);
        if node.is_nop() || node.flags.contains(OpFlags::RETHINK) {
            return;
        }
        node.flags.insert(OpFlags::RETHINK);
        self.queue.push_back(op);
    }

    fn requeue_neighbours(&mut self, op: OpIdx) {
        let near: Vec<OpIdx> = self
            .program
            .links
            .providers(op)
            .map(|(_, link)| link.provider)
            .chain(self.program.links.consumers(op).map(|(_, link)| link.consumer))
            .collect();
        self.requeue(op);
        for other in near {
            self.requeue(other);
        }
    }

    fn sole_provider(&self, op: OpIdx, slot: u8) -> Option<OpIdx> {
        match self.program.links.providers_for_slot(op, slot).as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    fn consumer_slots(&self, op: OpIdx) -> Vec<(OpIdx, u8)> {
        self.program
            .links
            .consumers(op)
            .map(|(_, link)| (link.consumer, link.slot))
            .collect()
    }

    /// Both variables fit the same register and the same spill slot.
    fn compatible(&self, a: VarId, b: VarId) -> bool {
        let (ta, tb) = (self.program.ty(a), self.program.ty(b));
        ta.class() == tb.class() && ta.slot_size() == tb.slot_size()
    }

    /// `var` is read or written by an operator strictly between two orders.
    fn touched_between(&self, var: VarId, lo: u32, hi: u32) -> bool {
        (lo + 1..hi).any(|order| {
            let op = self.program.op(OpIdx(order));
            op.result == var || op.reads(var)
        })
    }

    /// `var` holds the same value at `to` as it did when `from` read it.
    ///
    /// Either both sit in one span with no producer of `var` in
    /// `from..to`, or `var` has a single producer outside every loop and
    /// subroutine.
    fn unchanged(&self, var: VarId, from: OpIdx, to: OpIdx) -> bool {
        let (f, t) = (self.program.op(from), self.program.op(to));
        if f.result == var {
            return false;
        }
        if f.span == t.span && f.order < t.order {
            return !self.program.producers(var).any(|p| {
                let order = self.program.op(p).order;
                order >= f.order && order < t.order
            });
        }
        let mut producers = self.program.producers(var);
        match (producers.next(), producers.next()) {
            (Some(p), None) => self.graph.span(self.program.op(p).span).nesting == 0,
            _ => false,
        }
    }

    /// Move every consumer link of `from` over to `to`.
    fn relink_consumers(&mut self, from: OpIdx, to: OpIdx) -> CompileResult<()> {
        for idx in self.program.links.consumer_links(from) {
            let (consumer, slot) = {
                let link = self.program.links.get(idx);
                (link.consumer, link.slot)
            };
            self.program.links.unlink(idx);
            self.program.link(to, consumer, slot)?;
        }
        Ok(())
    }

    /// `P: a = ...; M: b = a` with `M` the only reader of `P`: let `P` write `b`.
    fn elide_upward(&mut self, m: OpIdx) -> CompileResult<bool> {
        let mov = self.program.op(m).clone();
        let (b, a) = (mov.result, mov.operands[0]);
        if mov.flags.contains(OpFlags::VOLATILE) || !self.compatible(a, b) {
            return Ok(false);
        }
        let Some(p) = self.sole_provider(m, 0) else {
            return Ok(false);
        };
        let prov = self.program.op(p);
        if prov.span != mov.span || prov.order >= mov.order || prov.result != a {
            return Ok(false);
        }
        if self.program.links.consumer_count(p) != 1
            || self.touched_between(b, prov.order, mov.order)
        {
            return Ok(false);
        }

        trace!("{} {} now writes {} directly, {} removed", p, prov.opcode.name(), b, m);
        self.program.set_result(p, b);
        self.relink_consumers(m, p)?;
        self.program.kill(m);
        self.requeue_neighbours(p);
        Ok(true)
    }

    /// `M: b = a` where `a` survives until every reader of `b`: read `a` instead.
    fn elide_downward(&mut self, m: OpIdx) -> CompileResult<bool> {
        let mov = self.program.op(m).clone();
        let (b, a) = (mov.result, mov.operands[0]);
        if mov.flags.contains(OpFlags::VOLATILE) || !self.compatible(a, b) {
            return Ok(false);
        }
        let consumers = self.consumer_slots(m);
        if consumers.is_empty() {
            return Ok(false);
        }
        for &(c, slot) in &consumers {
            if c == m || self.sole_provider(c, slot) != Some(m) || !self.unchanged(a, m, c) {
                return Ok(false);
            }
        }

        trace!("readers of {} at {} now read {}", b, m, a);
        let providers = self.program.links.providers_for_slot(m, 0);
        for (c, slot) in consumers {
            self.program.rewire_operand(c, slot, a, &providers)?;
            self.requeue(c);
        }
        self.program.kill(m);
        for p in providers {
            self.requeue(p);
        }
        Ok(true)
    }

    /// `L: t = load32 [..]; V: v = vec_from_gp t` becomes `L: v = vec_load32 [..]`.
    fn combine_load(&mut self, l: OpIdx) -> CompileResult<bool> {
        let load = self.program.op(l).clone();
        let v = match self.consumer_slots(l).as_slice() {
            [(v, 0)] => *v,
            _ => return Ok(false),
        };
        let widen = self.program.op(v);
        if widen.opcode != Opcode::VecFromGp
            || widen.span != load.span
            || widen.order <= load.order
            || widen.flags.contains(OpFlags::VOLATILE)
            || self.sole_provider(v, 0) != Some(l)
        {
            return Ok(false);
        }
        let wide = widen.result;
        if self.touched_between(wide, load.order, widen.order) {
            return Ok(false);
        }

        trace!("{} and {} combined into vec_load32 of {}", l, v, wide);
        self.program.op_mut(l).opcode = Opcode::VecLoad32;
        self.program.set_result(l, wide);
        self.relink_consumers(v, l)?;
        self.program.kill(v);
        self.requeue_neighbours(l);
        Ok(true)
    }

    /// Pull address arithmetic feeding a memory operator into its addressing mode.
    fn fold_address(&mut self, mop: OpIdx) -> CompileResult<bool> {
        let mem = self.program.op(mop).clone();
        if matches!(mem.addressing, Addressing::Static { .. }) {
            return Ok(false);
        }
        if mem.operands[0].is_some() {
            if let Some(p) = self.sole_provider(mop, 0) {
                if self.fold_base(mop, &mem, p)? {
                    self.requeue(mop);
                    return Ok(true);
                }
            }
        }
        if let Addressing::ScaledIndex { scale, disp } = mem.addressing {
            if let Some(p) = mem.operands[1].is_some().then(|| self.sole_provider(mop, 1)).flatten() {
                let shift = self.program.op(p).clone();
                let shifted = u32::try_from(shift.imm)
                    .ok()
                    .filter(|k| *k <= 3)
                    .map(|k| u32::from(scale) << k)
                    .filter(|s| *s <= 8);
                if let (Opcode::ShlImm, Some(new_scale)) = (shift.opcode, shifted) {
                    let x = shift.operands[0];
                    if self.unchanged(x, p, mop) {
                        trace!("{} shift of {} folded into scale {}", p, x, new_scale);
                        let providers = self.program.links.providers_for_slot(p, 0);
                        self.program.rewire_operand(mop, 1, x, &providers)?;
                        self.program.op_mut(mop).addressing = Addressing::ScaledIndex {
                            scale: new_scale as u8,
                            disp,
                        };
                        self.requeue(mop);
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    fn fold_base(&mut self, mop: OpIdx, mem: &Operator, p: OpIdx) -> CompileResult<bool> {
        let prov = self.program.op(p).clone();
        let plain_base = matches!(
            mem.addressing,
            Addressing::Direct | Addressing::BaseOffset { .. }
        ) && mem.operands[1].is_none();
        let operands_unchanged = prov
            .operand_slots()
            .all(|(_, x)| self.unchanged(x, p, mop));

        match prov.opcode {
            Opcode::PtrAddImm if operands_unchanged => {
                let Some(addressing) = with_displacement(mem.addressing, prov.imm) else {
                    return Ok(false);
                };
                trace!("{} offset {} folded into {}", p, prov.imm, mop);
                let providers = self.program.links.providers_for_slot(p, 0);
                self.program.rewire_operand(mop, 0, prov.operands[0], &providers)?;
                self.program.op_mut(mop).addressing = addressing;
                Ok(true)
            }
            Opcode::PtrAdd if operands_unchanged && plain_base => {
                trace!("{} sum folded into {} as base and index", p, mop);
                let base = self.program.links.providers_for_slot(p, 0);
                let index = self.program.links.providers_for_slot(p, 1);
                self.program.rewire_operand(mop, 0, prov.operands[0], &base)?;
                self.program.rewire_operand(mop, 1, prov.operands[1], &index)?;
                self.program.op_mut(mop).addressing = Addressing::ScaledIndex {
                    scale: 1,
                    disp: mem.addressing.disp(),
                };
                Ok(true)
            }
            Opcode::StaticAddr if plain_base => {
                let Some(pool) = prov.pool else {
                    return Ok(false);
                };
                trace!("{} constant address folded into {}", p, mop);
                self.program.rewire_operand(mop, 0, VarId::NONE, &[])?;
                self.program.op_mut(mop).addressing = Addressing::Static {
                    pool,
                    disp: mem.addressing.disp(),
                };
                if let Some(entry) = self.program.constants.get_mut(pool.0 as usize) {
                    entry.refs += 1;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// `n = not x` read only by ands: the ands become and-nots and `n` a copy of `x`.
    fn and_not(&mut self, n: OpIdx) -> bool {
        let not = self.program.op(n).clone();
        let (and, and_not) = match not.opcode {
            Opcode::Not => (Opcode::And, Opcode::AndNot),
            _ => (Opcode::VecAnd, Opcode::VecAndNot),
        };
        if not.flags.contains(OpFlags::VOLATILE) {
            return false;
        }
        let consumers = self.consumer_slots(n);
        if consumers.is_empty() {
            return false;
        }
        for &(c, slot) in &consumers {
            let op = self.program.op(c);
            if op.opcode != and
                || op.operands[0] == op.operands[1]
                || self.sole_provider(c, slot) != Some(n)
            {
                return false;
            }
        }

        trace!("{} negation moved into {} and-not consumers", n, consumers.len());
        for (c, slot) in consumers {
            if slot == 1 {
                self.program.swap_operand_slots(c, 0, 1);
            }
            self.program.op_mut(c).opcode = and_not;
            self.requeue(c);
        }
        self.program.op_mut(n).opcode = Opcode::Mov;
        self.requeue(n);
        true
    }
}

/// Add `imm` to the displacement, staying within `i32`.
fn with_displacement(addressing: Addressing, imm: i64) -> Option<Addressing> {
    let imm = i32::try_from(imm).ok()?;
    match addressing {
        Addressing::Direct => Some(Addressing::BaseOffset { disp: imm }),
        Addressing::BaseOffset { disp } => Some(Addressing::BaseOffset {
            disp: disp.checked_add(imm)?,
        }),
        Addressing::ScaledIndex { scale, disp } => Some(Addressing::ScaledIndex {
            scale,
            disp: disp.checked_add(imm)?,
        }),
        Addressing::Static { .. } => None,
    }
}
