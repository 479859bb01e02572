//! Loop and branch contexts of the register mapper.
//!
//! A context remembers the register state at its anchor (the loop start or
//! branch split) and which registers have been written since. An eviction
//! of a register that still holds its anchor-time occupant and was never
//! written inside the context can place its save at the anchor instead,
//! outside the loop body or the conditional span.

use crate::core::register_file::{PhysReg, RegBitSet, RegState};
use crate::ir::{OpIdx, VarId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Loop,
    Branch,
}

#[derive(Debug, Clone)]
pub struct MapContext {
    pub kind: ContextKind,
    /// `LoopStart` or `BranchSplit` operator.
    pub anchor: OpIdx,
    /// Register state the context was entered with.
    pub entry: RegState,
    /// Registers written since the anchor.
    pub touched: RegBitSet,
}

#[derive(Debug, Clone, Default)]
pub struct ContextStack {
    contexts: Vec<MapContext>,
}

impl ContextStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn push(&mut self, kind: ContextKind, anchor: OpIdx, entry: RegState) {
        self.contexts.push(MapContext {
            kind,
            anchor,
            entry,
            touched: RegBitSet::EMPTY,
        });
    }

    pub fn pop(&mut self) -> Option<MapContext> {
        self.contexts.pop()
    }

    pub fn last(&self) -> Option<&MapContext> {
        self.contexts.last()
    }

    /// Record a write to `reg` in every open context.
    pub fn touch(&mut self, reg: PhysReg) {
        for ctx in &mut self.contexts {
            ctx.touched.insert(reg);
        }
    }

    pub fn touch_all(&mut self, regs: RegBitSet) {
        for ctx in &mut self.contexts {
            ctx.touched = ctx.touched.union(regs);
        }
    }

    /// Outermost context whose anchor can host the save of `var` from `reg`.
    pub fn eviction_site(&self, reg: PhysReg, var: VarId) -> Option<usize> {
        self.contexts
            .iter()
            .position(|ctx| ctx.entry.occupant(reg) == Some(var) && !ctx.touched.contains(reg))
    }

    pub fn anchor(&self, depth: usize) -> OpIdx {
        self.contexts[depth].anchor
    }

    /// The save now happens at the anchor of context `depth`, so every
    /// context from there inwards enters with `reg` valid in memory.
    pub fn mark_saved(&mut self, depth: usize, reg: PhysReg, var: VarId) {
        for ctx in &mut self.contexts[depth..] {
            if ctx.entry.occupant(reg) == Some(var) {
                ctx.entry.set_in_memory(reg, true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eviction_site_prefers_outermost() {
        let v = VarId(3);
        let mut entry = RegState::new();
        entry.assign(PhysReg::RBX, v, false);

        let mut stack = ContextStack::new();
        stack.push(ContextKind::Loop, OpIdx(2), entry.clone());
        stack.push(ContextKind::Branch, OpIdx(5), entry);
        assert_eq!(stack.eviction_site(PhysReg::RBX, v), Some(0));

        stack.mark_saved(0, PhysReg::RBX, v);
        assert!(stack.last().unwrap().entry.is_in_memory(PhysReg::RBX));

        stack.touch(PhysReg::RBX);
        assert_eq!(stack.eviction_site(PhysReg::RBX, v), None);
        assert_eq!(stack.eviction_site(PhysReg::RCX, v), None);
    }

    #[test]
    fn test_touch_only_reaches_open_contexts() {
        let mut stack = ContextStack::new();
        stack.push(ContextKind::Loop, OpIdx(0), RegState::new());
        stack.touch_all(RegBitSet::of(&[PhysReg::RAX, PhysReg::RDX]));
        let ctx = stack.pop().unwrap();
        assert_eq!(ctx.touched.count(), 2);
        assert_eq!(ctx.kind, ContextKind::Loop);
        stack.touch(PhysReg::RAX);
        assert!(stack.is_empty());
    }
}
