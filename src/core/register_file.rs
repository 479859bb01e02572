//! Register file model.
//!
//! This module describes the fixed x86-64 register file the mapper allocates
//! from: sixteen general-purpose registers and sixteen XMM registers, two
//! register classes with rotation clocks, bit sets over all 32 slots, and the
//! register state (`RegState`) recording which variable occupies each slot and
//! whether that variable is also valid in its stack slot.

use crate::ir::VarId;
use iced_x86::Register;
use std::fmt;

/// Number of registers per class.
pub const REGS_PER_CLASS: usize = 16;

/// Total register slots tracked by a `RegState`.
pub const MAX_REGISTERS: usize = 2 * REGS_PER_CLASS;

/// Register class (register group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegClass {
    /// General-purpose integer and pointer registers.
    Gp,
    /// XMM vector registers.
    Vec,
}

impl RegClass {
    pub const fn index(self) -> usize {
        match self {
            RegClass::Gp => 0,
            RegClass::Vec => 1,
        }
    }

    /// Full register width in bytes.
    pub const fn width(self) -> u32 {
        match self {
            RegClass::Gp => 8,
            RegClass::Vec => 16,
        }
    }
}

/// Physical register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysReg {
    pub class: RegClass,
    pub id: u8,
}

const GP_REGISTERS: [Register; REGS_PER_CLASS] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RBX,
    Register::RSP,
    Register::RBP,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

const VEC_REGISTERS: [Register; REGS_PER_CLASS] = [
    Register::XMM0,
    Register::XMM1,
    Register::XMM2,
    Register::XMM3,
    Register::XMM4,
    Register::XMM5,
    Register::XMM6,
    Register::XMM7,
    Register::XMM8,
    Register::XMM9,
    Register::XMM10,
    Register::XMM11,
    Register::XMM12,
    Register::XMM13,
    Register::XMM14,
    Register::XMM15,
];

impl PhysReg {
    pub const RAX: PhysReg = PhysReg::gp(0);
    pub const RCX: PhysReg = PhysReg::gp(1);
    pub const RDX: PhysReg = PhysReg::gp(2);
    pub const RBX: PhysReg = PhysReg::gp(3);
    pub const RSP: PhysReg = PhysReg::gp(4);
    pub const RBP: PhysReg = PhysReg::gp(5);
    pub const RSI: PhysReg = PhysReg::gp(6);
    pub const RDI: PhysReg = PhysReg::gp(7);
    pub const R8: PhysReg = PhysReg::gp(8);
    pub const R9: PhysReg = PhysReg::gp(9);
    pub const R10: PhysReg = PhysReg::gp(10);
    pub const R11: PhysReg = PhysReg::gp(11);

    pub const fn gp(id: u8) -> Self {
        Self {
            class: RegClass::Gp,
            id,
        }
    }

    pub const fn vec(id: u8) -> Self {
        Self {
            class: RegClass::Vec,
            id,
        }
    }

    /// Linear slot index used by bit sets and register states.
    pub const fn slot(self) -> usize {
        self.class.index() * REGS_PER_CLASS + self.id as usize
    }

    pub const fn from_slot(slot: usize) -> Self {
        if slot < REGS_PER_CLASS {
            PhysReg::gp(slot as u8)
        } else {
            PhysReg::vec((slot - REGS_PER_CLASS) as u8)
        }
    }

    /// Concrete register handed to the encoder.
    pub fn to_register(self) -> Register {
        match self.class {
            RegClass::Gp => GP_REGISTERS[self.id as usize],
            RegClass::Vec => VEC_REGISTERS[self.id as usize],
        }
    }
}

impl fmt::Display for PhysReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_register())
    }
}

/// Bit set over all register slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct RegBitSet(u32);

impl RegBitSet {
    pub const EMPTY: RegBitSet = RegBitSet(0);

    pub const fn new() -> Self {
        RegBitSet(0)
    }

    pub const fn of(regs: &[PhysReg]) -> Self {
        let mut bits = 0u32;
        let mut i = 0;
        while i < regs.len() {
            bits |= 1 << regs[i].slot();
            i += 1;
        }
        RegBitSet(bits)
    }

    /// Every register of one class.
    pub const fn all_in_class(class: RegClass) -> Self {
        RegBitSet(0xffff << (class.index() * REGS_PER_CLASS))
    }

    pub const fn contains(self, reg: PhysReg) -> bool {
        self.0 & (1 << reg.slot()) != 0
    }

    pub fn insert(&mut self, reg: PhysReg) {
        self.0 |= 1 << reg.slot();
    }

    pub fn remove(&mut self, reg: PhysReg) {
        self.0 &= !(1 << reg.slot());
    }

    pub const fn union(self, other: RegBitSet) -> Self {
        RegBitSet(self.0 | other.0)
    }

    pub const fn intersect(self, other: RegBitSet) -> Self {
        RegBitSet(self.0 & other.0)
    }

    pub const fn difference(self, other: RegBitSet) -> Self {
        RegBitSet(self.0 & !other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn iter(self) -> impl Iterator<Item = PhysReg> {
        (0..MAX_REGISTERS)
            .filter(move |slot| self.0 & (1 << slot) != 0)
            .map(PhysReg::from_slot)
    }
}

/// Registers a SysV call may overwrite.
pub const CALLER_SAVED: RegBitSet = RegBitSet::of(&[
    PhysReg::RAX,
    PhysReg::RCX,
    PhysReg::RDX,
    PhysReg::RSI,
    PhysReg::RDI,
    PhysReg::R8,
    PhysReg::R9,
    PhysReg::R10,
    PhysReg::R11,
])
.union(RegBitSet::all_in_class(RegClass::Vec));

/// Occupancy of every register slot plus the "also valid in memory" bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegState {
    slots: [Option<VarId>; MAX_REGISTERS],
    in_memory: RegBitSet,
}

impl Default for RegState {
    fn default() -> Self {
        Self::new()
    }
}

impl RegState {
    pub fn new() -> Self {
        Self {
            slots: [None; MAX_REGISTERS],
            in_memory: RegBitSet::new(),
        }
    }

    pub fn occupant(&self, reg: PhysReg) -> Option<VarId> {
        self.slots[reg.slot()]
    }

    pub fn is_in_memory(&self, reg: PhysReg) -> bool {
        self.in_memory.contains(reg)
    }

    pub fn assign(&mut self, reg: PhysReg, var: VarId, in_memory: bool) {
        self.slots[reg.slot()] = Some(var);
        self.set_in_memory(reg, in_memory);
    }

    pub fn set_in_memory(&mut self, reg: PhysReg, in_memory: bool) {
        if in_memory {
            self.in_memory.insert(reg);
        } else {
            self.in_memory.remove(reg);
        }
    }

    /// Remove the occupant of `reg`, returning it.
    pub fn clear(&mut self, reg: PhysReg) -> Option<VarId> {
        self.in_memory.remove(reg);
        self.slots[reg.slot()].take()
    }

    pub fn clear_all(&mut self) {
        *self = Self::new();
    }

    pub fn find(&self, var: VarId) -> Option<PhysReg> {
        self.slots
            .iter()
            .position(|slot| *slot == Some(var))
            .map(PhysReg::from_slot)
    }

    /// Occupied registers with their variables.
    pub fn occupied(&self) -> impl Iterator<Item = (PhysReg, VarId)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, var)| var.map(|v| (PhysReg::from_slot(slot), v)))
    }

    pub fn occupied_set(&self) -> RegBitSet {
        let mut set = RegBitSet::new();
        for (reg, _) in self.occupied() {
            set.insert(reg);
        }
        set
    }

    /// Drop every occupant for which `keep` returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(VarId) -> bool) {
        for slot in 0..MAX_REGISTERS {
            if let Some(var) = self.slots[slot] {
                if !keep(var) {
                    self.clear(PhysReg::from_slot(slot));
                }
            }
        }
    }
}

/// Allocatable registers and per-class rotation clocks.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    allocatable: RegBitSet,
    clocks: [u8; 2],
}

impl RegisterFile {
    /// RSP is never allocatable; RBP only when the frame pointer is given up.
    pub fn new(allow_frame_pointer: bool) -> Self {
        let mut allocatable = RegBitSet::all_in_class(RegClass::Gp)
            .union(RegBitSet::all_in_class(RegClass::Vec));
        allocatable.remove(PhysReg::RSP);
        if !allow_frame_pointer {
            allocatable.remove(PhysReg::RBP);
        }
        Self {
            allocatable,
            clocks: [0; 2],
        }
    }

    pub fn allocatable(&self) -> RegBitSet {
        self.allocatable
    }

    pub fn is_allocatable(&self, reg: PhysReg) -> bool {
        self.allocatable.contains(reg)
    }

    /// Allocatable registers of `class` starting at the class clock.
    pub fn rotation(&self, class: RegClass) -> impl Iterator<Item = PhysReg> + '_ {
        let start = self.clocks[class.index()] as usize;
        (0..REGS_PER_CLASS)
            .map(move |offset| {
                let id = ((start + offset) % REGS_PER_CLASS) as u8;
                PhysReg { class, id }
            })
            .filter(move |reg| self.allocatable.contains(*reg))
    }

    /// First register of `class` in rotation order that is in `candidates`.
    pub fn next_in_rotation(&self, class: RegClass, candidates: RegBitSet) -> Option<PhysReg> {
        self.rotation(class).find(|reg| candidates.contains(*reg))
    }

    /// Move the class clock past `reg`.
    pub fn advance(&mut self, reg: PhysReg) {
        self.clocks[reg.class.index()] = ((reg.id as usize + 1) % REGS_PER_CLASS) as u8;
    }

    pub fn reset(&mut self) {
        self.clocks = [0; 2];
    }
}
