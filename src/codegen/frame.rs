//! Stack frame layout for spilled variables.

use crate::core::var_set::VarSet;
use crate::ir::{Program, VarId};
use hashbrown::HashMap;
use log::debug;

/// Frame slots of every variable that ever lives in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameLayout {
    slots: HashMap<VarId, i32>,
    size: u32,
    align_mask: u32,
}

impl FrameLayout {
    /// Slots are packed by size tier, 16-byte slots first, so every slot is
    /// naturally aligned without padding between tiers.
    pub fn build(program: &Program<'_>, saved: &VarSet, negative_offsets: bool) -> Self {
        let mut slots = HashMap::new();
        let mut offset = 0u32;
        let mut largest = 0u32;
        for tier in [16, 8, 4] {
            for var in saved.iter() {
                let size = program.ty(var).slot_size();
                if size != tier {
                    continue;
                }
                largest = largest.max(size);
                let reported = if negative_offsets {
                    -((offset + size) as i32)
                } else {
                    offset as i32
                };
                slots.insert(var, reported);
                offset += size;
            }
        }

        let align_mask = largest.saturating_sub(1);
        let size = (offset + align_mask) & !align_mask;
        debug!(
            "frame: {} slots, {} bytes, alignment {}",
            slots.len(),
            size,
            align_mask + 1
        );
        program.session().record(|stats| stats.frame_size = size);
        Self {
            slots,
            size,
            align_mask,
        }
    }

    /// Offset of `var` from the frame base.
    pub fn offset(&self, var: VarId) -> Option<i32> {
        self.slots.get(&var).copied()
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// 15, 7 or 3 depending on the largest slot; 0 for an empty frame.
    pub fn align_mask(&self) -> u32 {
        self.align_mask
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
