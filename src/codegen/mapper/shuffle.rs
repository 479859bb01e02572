//! Shuffle records and register-state equalization.

use crate::core::register_file::{PhysReg, RegBitSet, RegClass, RegState};
use crate::ir::{Program, VarId};
use log::trace;
use std::fmt;

/// A register/memory transfer the encoder emits between operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shuffle {
    /// Store `reg` into the frame slot of `var`.
    Save {
        var: VarId,
        reg: PhysReg,
        width: u32,
        /// Attached to an enclosing loop or branch instead of the evicting operator.
        hoisted: bool,
    },
    /// Reload `var` from its frame slot.
    Load { var: VarId, reg: PhysReg, width: u32 },
    Move {
        var: VarId,
        from: PhysReg,
        to: PhysReg,
        width: u32,
    },
    /// Exchange two general-purpose registers.
    Swap { a: PhysReg, b: PhysReg },
}

impl Shuffle {
    /// Register the shuffle overwrites, if any.
    pub fn writes(&self) -> RegBitSet {
        match *self {
            Shuffle::Save { .. } => RegBitSet::EMPTY,
            Shuffle::Load { reg, .. } => RegBitSet::of(&[reg]),
            Shuffle::Move { to, .. } => RegBitSet::of(&[to]),
            Shuffle::Swap { a, b } => RegBitSet::of(&[a, b]),
        }
    }

    pub fn is_save(&self) -> bool {
        matches!(self, Shuffle::Save { .. })
    }
}

impl fmt::Display for Shuffle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Shuffle::Save {
                var, reg, hoisted, ..
            } => write!(f, "save {} <- {}{}", var, reg, if hoisted { " (hoisted)" } else { "" }),
            Shuffle::Load { var, reg, .. } => write!(f, "load {} -> {}", var, reg),
            Shuffle::Move { var, from, to, .. } => write!(f, "move {} {} -> {}", var, from, to),
            Shuffle::Swap { a, b } => write!(f, "swap {} <-> {}", a, b),
        }
    }
}

/// Computes the shuffles that turn one register state into another.
pub struct ShufflePlanner<'p, 'a> {
    program: &'p Program<'a>,
    allocatable: RegBitSet,
    memory_shuffling: bool,
    full_width_moves: bool,
}

impl<'p, 'a> ShufflePlanner<'p, 'a> {
    pub fn new(
        program: &'p Program<'a>,
        allocatable: RegBitSet,
        memory_shuffling: bool,
        full_width_moves: bool,
    ) -> Self {
        Self {
            program,
            allocatable,
            memory_shuffling,
            full_width_moves,
        }
    }

    pub fn slot_width(&self, var: VarId) -> u32 {
        self.program.ty(var).slot_size()
    }

    pub fn move_width(&self, var: VarId) -> u32 {
        let ty = self.program.ty(var);
        if self.full_width_moves {
            ty.class().width()
        } else {
            ty.slot_size()
        }
    }

    pub fn save(&self, var: VarId, reg: PhysReg) -> Shuffle {
        Shuffle::Save {
            var,
            reg,
            width: self.slot_width(var),
            hoisted: false,
        }
    }

    pub fn load(&self, var: VarId, reg: PhysReg) -> Shuffle {
        Shuffle::Load {
            var,
            reg,
            width: self.slot_width(var),
        }
    }

    pub fn mov(&self, var: VarId, from: PhysReg, to: PhysReg) -> Shuffle {
        Shuffle::Move {
            var,
            from,
            to,
            width: self.move_width(var),
        }
    }

    /// Shuffles taking `current` to `target`; `current` ends equal to `target`.
    ///
    /// Both states must already be restricted to the variables live at the
    /// join. Order: saves, drops, parallel moves, loads. A variable `target`
    /// keeps in memory, or does not keep in a register at all, is saved first
    /// when its memory copy is stale.
    pub fn plan(&self, current: &mut RegState, target: &RegState) -> Vec<Shuffle> {
        let mut out = Vec::new();

        for (reg, var) in current.occupied().collect::<Vec<_>>() {
            let wants_memory = target.find(var).map_or(true, |t| target.is_in_memory(t));
            if wants_memory && !current.is_in_memory(reg) {
                out.push(self.save(var, reg));
                current.set_in_memory(reg, true);
            }
        }

        for (reg, var) in current.occupied().collect::<Vec<_>>() {
            if target.find(var).is_none() {
                current.clear(reg);
            }
        }

        let mut pending: Vec<(PhysReg, PhysReg, VarId)> = current
            .occupied()
            .filter_map(|(reg, var)| {
                let to = target.find(var)?;
                (to != reg).then_some((reg, to, var))
            })
            .collect();
        while !pending.is_empty() {
            if let Some(i) = pending
                .iter()
                .position(|(_, to, _)| current.occupant(*to).is_none())
            {
                let (from, to, var) = pending.swap_remove(i);
                let in_memory = current.is_in_memory(from);
                current.clear(from);
                current.assign(to, var, in_memory);
                out.push(self.mov(var, from, to));
                continue;
            }

            // Every destination is still held by another pending source.
            let (from, to, var) = pending[0];
            if !self.memory_shuffling && from.class == RegClass::Gp {
                let (Some(other), in_a, in_b) = (
                    current.occupant(to),
                    current.is_in_memory(from),
                    current.is_in_memory(to),
                ) else {
                    break;
                };
                current.assign(to, var, in_a);
                current.assign(from, other, in_b);
                out.push(Shuffle::Swap { a: from, b: to });
                pending.remove(0);
                for entry in pending.iter_mut() {
                    if entry.2 == other {
                        entry.0 = from;
                    }
                }
                pending.retain(|(f, t, _)| f != t);
                continue;
            }
            if !self.memory_shuffling {
                let scratch = self
                    .allocatable
                    .intersect(RegBitSet::all_in_class(from.class))
                    .difference(current.occupied_set())
                    .iter()
                    .next();
                if let Some(scratch) = scratch {
                    let in_memory = current.is_in_memory(from);
                    current.clear(from);
                    current.assign(scratch, var, in_memory);
                    out.push(self.mov(var, from, scratch));
                    pending[0].0 = scratch;
                    continue;
                }
            }
            if !current.is_in_memory(from) {
                out.push(self.save(var, from));
            }
            current.clear(from);
            pending.remove(0);
        }

        for (reg, var) in target.occupied() {
            if current.occupant(reg) != Some(var) {
                out.push(self.load(var, reg));
                current.assign(reg, var, true);
            }
            current.set_in_memory(reg, target.is_in_memory(reg));
        }

        for shuffle in &out {
            trace!("equalize: {}", shuffle);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::CompilationSession;
    use crate::ir::VarType;
    use bumpalo::Bump;

    fn states_equal(a: &RegState, b: &RegState) -> bool {
        a.occupied().collect::<Vec<_>>() == b.occupied().collect::<Vec<_>>()
            && b.occupied().all(|(r, _)| a.is_in_memory(r) == b.is_in_memory(r))
    }

    fn gp_program<'a>(session: &'a CompilationSession<'a>, count: usize) -> (Program<'a>, Vec<VarId>) {
        let mut program = Program::new(session);
        let vars = (0..count).map(|_| program.alloc_var(VarType::I64)).collect();
        (program, vars)
    }

    #[test]
    fn test_plain_moves_and_loads() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let (program, v) = gp_program(&session, 3);
        let planner = ShufflePlanner::new(&program, RegBitSet::all_in_class(RegClass::Gp), true, false);

        let mut current = RegState::new();
        current.assign(PhysReg::RAX, v[0], false);
        current.assign(PhysReg::RBX, v[2], true);
        let mut target = RegState::new();
        target.assign(PhysReg::RCX, v[0], false);
        target.assign(PhysReg::RDX, v[1], true);

        let shuffles = planner.plan(&mut current, &target);
        assert_eq!(
            shuffles,
            vec![
                planner.mov(v[0], PhysReg::RAX, PhysReg::RCX),
                planner.load(v[1], PhysReg::RDX),
            ]
        );
        assert!(states_equal(&current, &target));
    }

    #[test]
    fn test_cycle_through_memory() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let (program, v) = gp_program(&session, 2);
        let planner = ShufflePlanner::new(&program, RegBitSet::all_in_class(RegClass::Gp), true, false);

        let mut current = RegState::new();
        current.assign(PhysReg::RAX, v[0], false);
        current.assign(PhysReg::RCX, v[1], false);
        let mut target = RegState::new();
        target.assign(PhysReg::RCX, v[0], false);
        target.assign(PhysReg::RAX, v[1], false);

        let shuffles = planner.plan(&mut current, &target);
        assert!(shuffles.iter().any(Shuffle::is_save));
        assert!(shuffles.iter().any(|s| matches!(s, Shuffle::Load { .. })));
        assert!(states_equal(&current, &target));
    }

    #[test]
    fn test_cycle_with_swap() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let (program, v) = gp_program(&session, 3);
        let planner = ShufflePlanner::new(&program, RegBitSet::all_in_class(RegClass::Gp), false, false);

        // Three-way rotation.
        let mut current = RegState::new();
        current.assign(PhysReg::RAX, v[0], false);
        current.assign(PhysReg::RCX, v[1], false);
        current.assign(PhysReg::RDX, v[2], true);
        let mut target = RegState::new();
        target.assign(PhysReg::RCX, v[0], false);
        target.assign(PhysReg::RDX, v[1], false);
        target.assign(PhysReg::RAX, v[2], true);

        let shuffles = planner.plan(&mut current, &target);
        assert_eq!(shuffles.len(), 2);
        assert!(shuffles.iter().all(|s| matches!(s, Shuffle::Swap { .. })));
        assert!(states_equal(&current, &target));
    }

    #[test]
    fn test_vector_cycle_uses_scratch() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut program = Program::new(&session);
        let a = program.alloc_var(VarType::V128);
        let b = program.alloc_var(VarType::V128);
        let planner = ShufflePlanner::new(&program, RegBitSet::all_in_class(RegClass::Vec), false, true);

        let mut current = RegState::new();
        current.assign(PhysReg::vec(0), a, false);
        current.assign(PhysReg::vec(1), b, false);
        let mut target = RegState::new();
        target.assign(PhysReg::vec(1), a, false);
        target.assign(PhysReg::vec(0), b, false);

        let shuffles = planner.plan(&mut current, &target);
        assert_eq!(shuffles.len(), 3);
        assert!(shuffles
            .iter()
            .all(|s| matches!(s, Shuffle::Move { width: 16, .. })));
        assert!(states_equal(&current, &target));
    }

    #[test]
    fn test_memory_bits_follow_target() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let (program, v) = gp_program(&session, 2);
        let planner = ShufflePlanner::new(&program, RegBitSet::all_in_class(RegClass::Gp), true, false);

        let mut current = RegState::new();
        current.assign(PhysReg::RAX, v[0], false);
        current.assign(PhysReg::RBX, v[1], false);
        let mut target = RegState::new();
        target.assign(PhysReg::RAX, v[0], true);

        let shuffles = planner.plan(&mut current, &target);
        // One save to satisfy the target bit, one because `v1` leaves the registers.
        assert_eq!(
            shuffles,
            vec![planner.save(v[0], PhysReg::RAX), planner.save(v[1], PhysReg::RBX)]
        );
        assert!(states_equal(&current, &target));
    }
}
