// This module defines the operator/variable store that every later phase works on. Variables
// are numbered (id 0 means "no variable") and typed with one of the general-purpose or vector
// register classes. Operators carry an opcode, a result variable, up to three operand variables,
// an addressing mode, an immediate, an optional constant-pool reference, their program order and
// owning span, a flag word, a structural partner link for control operators, and a per-result
// producer chain in descending program order. Links between providers and consumers live in the
// LinkTable (links.rs) and the emission interface lives in Program (program.rs). All tables are
// index based: compilation is single threaded and scoped to one program, so plain indices into
// growable vectors replace the pointer-linked structures of a classic arena layout.

//! Intermediate representation: variables, operators, links and the program store.

pub mod links;
pub mod opcode;
pub mod program;

use crate::core::register_file::RegClass;
use std::fmt;

pub use links::{LinkIdx, LinkTable};
pub use opcode::{ClassReq, ControlKind, MemAccess, OpInfo, Opcode};
pub use program::{ConstantEntry, OperatorHandle, PoolIdx, Program};

/// Numbered variable; `VarId::NONE` (0) is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct VarId(pub u32);

impl VarId {
    pub const NONE: VarId = VarId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn is_some(self) -> bool {
        self.0 != 0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Index of an operator in program order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpIdx(pub u32);

impl OpIdx {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for OpIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Index of a span (basic block).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SpanIdx(pub u32);

impl SpanIdx {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SpanIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "span{}", self.0)
    }
}

/// Value type of a variable.
///
/// The type decides the register class and the size of the spill slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarType {
    I32,
    I64,
    Ptr,
    V64,
    V128,
}

/// Pointer width of the target.
pub const POINTER_SIZE: u32 = 8;

impl VarType {
    pub fn class(self) -> RegClass {
        match self {
            VarType::I32 | VarType::I64 | VarType::Ptr => RegClass::Gp,
            VarType::V64 | VarType::V128 => RegClass::Vec,
        }
    }

    /// Size in bytes of the spill slot for this type.
    pub fn slot_size(self) -> u32 {
        match self {
            VarType::I32 => 4,
            VarType::I64 | VarType::V64 => 8,
            VarType::Ptr => POINTER_SIZE,
            VarType::V128 => 16,
        }
    }
}

/// Variable table entry.
#[derive(Debug, Clone)]
pub struct Variable {
    pub ty: VarType,
    /// Set once any emitted operator writes the variable.
    pub initialized: bool,
    /// Latest producer in program order; continues through `Operator::next_producer`.
    pub producer_head: Option<OpIdx>,
}

/// How a memory operator forms its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Addressing {
    /// Plain register operands.
    #[default]
    Direct,
    /// `[base + disp]`, base in slot 0.
    BaseOffset { disp: i32 },
    /// `[base + index * scale + disp]`, base in slot 0 and index in slot 1.
    ScaledIndex { scale: u8, disp: i32 },
    /// `[constant_pool[pool] + disp]`, no register operands.
    Static { pool: PoolIdx, disp: i32 },
}

impl Addressing {
    pub fn disp(&self) -> i32 {
        match *self {
            Addressing::Direct => 0,
            Addressing::BaseOffset { disp }
            | Addressing::ScaledIndex { disp, .. }
            | Addressing::Static { disp, .. } => disp,
        }
    }
}

/// Operator flag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpFlags(u8);

impl OpFlags {
    /// Marked live by dead-code elimination.
    pub const IN_USE: u8 = 1 << 0;
    /// Sitting in the reducer's rethink queue.
    pub const RETHINK: u8 = 1 << 1;
    /// Externally observable; never removed.
    pub const VOLATILE: u8 = 1 << 2;

    pub fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn insert(&mut self, bit: u8) {
        self.0 |= bit;
    }

    pub fn remove(&mut self, bit: u8) {
        self.0 &= !bit;
    }
}

/// One IR instruction.
#[derive(Debug, Clone)]
pub struct Operator {
    pub opcode: Opcode,
    pub result: VarId,
    pub operands: [VarId; 3],
    pub addressing: Addressing,
    /// Immediate operand, displacement source or shift amount depending on the opcode.
    pub imm: i64,
    /// Constant-pool payload referenced by `Const`/`StaticAddr`.
    pub pool: Option<PoolIdx>,
    pub order: u32,
    pub span: SpanIdx,
    pub flags: OpFlags,
    /// Structural partner of a control operator.
    pub linked: Option<OpIdx>,
    /// Next older producer of `result`.
    pub next_producer: Option<OpIdx>,
}

impl Operator {
    pub fn info(&self) -> OpInfo {
        self.opcode.info()
    }

    pub fn is_nop(&self) -> bool {
        self.opcode == Opcode::Nop
    }

    /// Operand slots holding a variable.
    pub fn operand_slots(&self) -> impl Iterator<Item = (usize, VarId)> + '_ {
        self.operands
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, var)| var.is_some())
    }

    pub fn reads(&self, var: VarId) -> bool {
        var.is_some() && self.operands.contains(&var)
    }

    /// Constant-pool entry this operator keeps alive, if any.
    pub fn pool_ref(&self) -> Option<PoolIdx> {
        match self.addressing {
            Addressing::Static { pool, .. } => Some(pool),
            _ => self.pool,
        }
    }
}
