//! Opcode table.
//!
//! Every phase matches on `Opcode` exhaustively; the static properties the
//! phases need (operand count, memory access, control kind, two-operand
//! form, register class requirements, fixed registers) come from
//! `Opcode::info` and `Opcode::fixed_regs`.

use crate::core::register_file::{PhysReg, RegBitSet, CALLER_SAVED};

/// IR opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Nop,
    /// `result = op1`
    Mov,
    /// `result = imm` or the attached constant payload.
    Const,
    /// `result = &constant_pool[pool]`
    StaticAddr,

    Load32,
    Load64,
    Store32,
    Store64,

    /// `result = op1 + op2`
    PtrAdd,
    /// `result = op1 + imm`
    PtrAddImm,

    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    /// `result = !op1 & op2`
    AndNot,
    Not,
    Shl,
    Shr,
    Sar,
    ShlImm,
    ShrImm,
    Div,
    Rem,

    /// Zero-extending 32-bit load into a vector register.
    VecLoad32,
    VecLoad128,
    VecStore128,
    VecFromGp,
    VecToGp,
    VecAdd32,
    VecSub32,
    VecMulLo16,
    VecAnd,
    VecOr,
    VecXor,
    /// `result = !op1 & op2`
    VecAndNot,
    VecNot,
    /// Lane shuffle selected by `imm`.
    VecShuffle32,
    VecUnpackLo8,
    VecPackUs16,

    /// Call to an external helper selected by `imm`.
    CallExt,

    Boundary,
    LoopStart,
    /// Jumps back to the body while `op1 != 0`.
    LoopRepeat,
    /// Executes the taken span while `op1 != 0`.
    BranchSplit,
    BranchMerge,
    SubCall,
    SubStart,
    SubReturn,
    Return,
}

/// Structural role of a control operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    Boundary,
    LoopStart,
    LoopRepeat,
    BranchSplit,
    BranchMerge,
    SubCall,
    SubStart,
    SubReturn,
    Return,
}

/// Memory access performed by an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccess {
    None,
    Load,
    Store,
}

/// Register class an operand or result must live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassReq {
    /// No register involved.
    None,
    /// Follows the variable type.
    Any,
    Gp,
    Vec,
}

/// Static opcode properties.
#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub name: &'static str,
    /// Number of operand slots in use.
    pub operands: u8,
    pub has_result: bool,
    pub memory: MemAccess,
    pub side_effect: bool,
    pub control: Option<ControlKind>,
    pub commutative: bool,
    /// Result shares the register of operand 1 (x86 two-operand form).
    pub destructive: bool,
    pub result_class: ClassReq,
    pub operand_class: [ClassReq; 3],
}

/// Fixed-register constraints of an opcode.
#[derive(Debug, Clone, Copy)]
pub struct FixedRegs {
    pub operands: [Option<PhysReg>; 3],
    pub result: Option<PhysReg>,
    /// Registers destroyed besides the result.
    pub clobbers: RegBitSet,
}

impl FixedRegs {
    pub const NONE: FixedRegs = FixedRegs {
        operands: [None; 3],
        result: None,
        clobbers: RegBitSet::EMPTY,
    };

    /// Every register the opcode pins or destroys.
    pub fn reserved(&self) -> RegBitSet {
        let mut set = self.clobbers;
        for reg in self.operands.iter().flatten() {
            set.insert(*reg);
        }
        if let Some(reg) = self.result {
            set.insert(reg);
        }
        set
    }
}

use ClassReq::{Any, Gp, Vec as V};

const N: ClassReq = ClassReq::None;

const fn alu(name: &'static str, commutative: bool) -> OpInfo {
    OpInfo {
        name,
        operands: 2,
        has_result: true,
        memory: MemAccess::None,
        side_effect: false,
        control: None,
        commutative,
        destructive: true,
        result_class: Gp,
        operand_class: [Gp, Gp, N],
    }
}

const fn valu(name: &'static str, commutative: bool) -> OpInfo {
    OpInfo {
        name,
        operands: 2,
        has_result: true,
        memory: MemAccess::None,
        side_effect: false,
        control: None,
        commutative,
        destructive: true,
        result_class: V,
        operand_class: [V, V, N],
    }
}

const fn control(name: &'static str, kind: ControlKind, operands: u8) -> OpInfo {
    OpInfo {
        name,
        operands,
        has_result: false,
        memory: MemAccess::None,
        side_effect: true,
        control: Some(kind),
        commutative: false,
        destructive: false,
        result_class: N,
        operand_class: if operands == 1 { [Gp, N, N] } else { [N, N, N] },
    }
}

const fn load(name: &'static str, result_class: ClassReq) -> OpInfo {
    OpInfo {
        name,
        operands: 2,
        has_result: true,
        memory: MemAccess::Load,
        side_effect: false,
        control: None,
        commutative: false,
        destructive: false,
        result_class,
        operand_class: [Gp, Gp, N],
    }
}

const fn store(name: &'static str, value_class: ClassReq) -> OpInfo {
    OpInfo {
        name,
        operands: 3,
        has_result: false,
        memory: MemAccess::Store,
        side_effect: true,
        control: None,
        commutative: false,
        destructive: false,
        result_class: N,
        operand_class: [Gp, Gp, value_class],
    }
}

const fn nullary(name: &'static str, result_class: ClassReq) -> OpInfo {
    OpInfo {
        name,
        operands: 0,
        has_result: true,
        memory: MemAccess::None,
        side_effect: false,
        control: None,
        commutative: false,
        destructive: false,
        result_class,
        operand_class: [N, N, N],
    }
}

const fn unary(name: &'static str, result_class: ClassReq, operand: ClassReq, destructive: bool) -> OpInfo {
    OpInfo {
        name,
        operands: 1,
        has_result: true,
        memory: MemAccess::None,
        side_effect: false,
        control: None,
        commutative: false,
        destructive,
        result_class,
        operand_class: [operand, N, N],
    }
}

impl Opcode {
    pub const fn info(self) -> OpInfo {
        use Opcode::*;
        match self {
            Nop => OpInfo {
                name: "nop",
                operands: 0,
                has_result: false,
                memory: MemAccess::None,
                side_effect: false,
                control: None,
                commutative: false,
                destructive: false,
                result_class: N,
                operand_class: [N, N, N],
            },
            Mov => unary("mov", Any, Any, false),
            Const => nullary("const", Any),
            StaticAddr => nullary("static_addr", Gp),

            Load32 => load("load32", Gp),
            Load64 => load("load64", Gp),
            Store32 => store("store32", Gp),
            Store64 => store("store64", Gp),

            PtrAdd => OpInfo {
                name: "ptr_add",
                operands: 2,
                has_result: true,
                memory: MemAccess::None,
                side_effect: false,
                control: None,
                commutative: true,
                destructive: false,
                result_class: Gp,
                operand_class: [Gp, Gp, N],
            },
            PtrAddImm => unary("ptr_add_imm", Gp, Gp, false),

            Add => alu("add", true),
            Sub => alu("sub", false),
            Mul => alu("mul", true),
            And => alu("and", true),
            Or => alu("or", true),
            Xor => alu("xor", true),
            AndNot => alu("andnot", false),
            Not => unary("not", Gp, Gp, true),
            Shl => alu("shl", false),
            Shr => alu("shr", false),
            Sar => alu("sar", false),
            ShlImm => unary("shl_imm", Gp, Gp, true),
            ShrImm => unary("shr_imm", Gp, Gp, true),
            Div => OpInfo {
                name: "div",
                operands: 2,
                has_result: true,
                memory: MemAccess::None,
                side_effect: false,
                control: None,
                commutative: false,
                destructive: false,
                result_class: Gp,
                operand_class: [Gp, Gp, N],
            },
            Rem => OpInfo {
                name: "rem",
                operands: 2,
                has_result: true,
                memory: MemAccess::None,
                side_effect: false,
                control: None,
                commutative: false,
                destructive: false,
                result_class: Gp,
                operand_class: [Gp, Gp, N],
            },

            VecLoad32 => load("vec_load32", V),
            VecLoad128 => load("vec_load128", V),
            VecStore128 => store("vec_store128", V),
            VecFromGp => unary("vec_from_gp", V, Gp, false),
            VecToGp => unary("vec_to_gp", Gp, V, false),
            VecAdd32 => valu("vec_add32", true),
            VecSub32 => valu("vec_sub32", false),
            VecMulLo16 => valu("vec_mullo16", true),
            VecAnd => valu("vec_and", true),
            VecOr => valu("vec_or", true),
            VecXor => valu("vec_xor", true),
            VecAndNot => valu("vec_andnot", false),
            VecNot => unary("vec_not", V, V, true),
            VecShuffle32 => unary("vec_shuffle32", V, V, false),
            VecUnpackLo8 => valu("vec_unpacklo8", false),
            VecPackUs16 => valu("vec_packus16", false),

            CallExt => OpInfo {
                name: "call_ext",
                operands: 2,
                has_result: true,
                memory: MemAccess::None,
                side_effect: true,
                control: None,
                commutative: false,
                destructive: false,
                result_class: Gp,
                operand_class: [Gp, Gp, N],
            },

            Boundary => control("boundary", ControlKind::Boundary, 0),
            LoopStart => control("loop_start", ControlKind::LoopStart, 0),
            LoopRepeat => control("loop_repeat", ControlKind::LoopRepeat, 1),
            BranchSplit => control("branch_split", ControlKind::BranchSplit, 1),
            BranchMerge => control("branch_merge", ControlKind::BranchMerge, 0),
            SubCall => control("sub_call", ControlKind::SubCall, 0),
            SubStart => control("sub_start", ControlKind::SubStart, 0),
            SubReturn => control("sub_return", ControlKind::SubReturn, 0),
            Return => control("return", ControlKind::Return, 0),
        }
    }

    pub const fn name(self) -> &'static str {
        self.info().name
    }

    pub const fn is_control(self) -> bool {
        self.info().control.is_some()
    }

    pub const fn is_memory(self) -> bool {
        !matches!(self.info().memory, MemAccess::None)
    }

    /// Registers the opcode pins its operands or result to, and what it destroys.
    pub const fn fixed_regs(self) -> FixedRegs {
        use Opcode::*;
        match self {
            Div => FixedRegs {
                operands: [Some(PhysReg::RAX), None, None],
                result: Some(PhysReg::RAX),
                clobbers: RegBitSet::of(&[PhysReg::RDX]),
            },
            Rem => FixedRegs {
                operands: [Some(PhysReg::RAX), None, None],
                result: Some(PhysReg::RDX),
                clobbers: RegBitSet::of(&[PhysReg::RAX]),
            },
            Shl | Shr | Sar => FixedRegs {
                operands: [None, Some(PhysReg::RCX), None],
                result: None,
                clobbers: RegBitSet::EMPTY,
            },
            CallExt => FixedRegs {
                operands: [Some(PhysReg::RDI), Some(PhysReg::RSI), None],
                result: Some(PhysReg::RAX),
                clobbers: CALLER_SAVED,
            },
            _ => FixedRegs::NONE,
        }
    }
}
