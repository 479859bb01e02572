//! spanjit - span-graph JIT middle and back end.
//!
//! A front end emits a linear operator program into a [`Program`]. Compiling
//! it splits the program into spans, links every operand to the operators
//! that may provide its value, converts to SSA, reduces and prunes dead code,
//! then maps every variable onto x86-64 registers and stack slots. The result
//! is a [`CompiledBlob`] an encoder turns into machine code.
//!
//! # Usage
//!
//! ```ignore
//! use spanjit::{CompilationSession, CompileOptions, Opcode, Program, VarId, VarType};
//! use bumpalo::Bump;
//!
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let mut program = Program::new(&session);
//!
//! let p = program.alloc_var(VarType::Ptr);
//! let x = program.alloc_var(VarType::I64);
//! program.add_operator(Opcode::Const, p, VarId::NONE, VarId::NONE, VarId::NONE);
//! program.add_operator(Opcode::Load64, x, p, VarId::NONE, VarId::NONE);
//! program.add_operator(Opcode::Store64, VarId::NONE, p, VarId::NONE, x);
//!
//! let blob = program.compile(&CompileOptions::default())?;
//! for (op, mapping) in blob.operators().iter().zip(blob.mappings()) {
//!     // encode `mapping.before`, then `op` with `mapping.operands`/`mapping.result`
//! }
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - variables, operators, links and the emission interface
//! - [`analysis`] - span graph, dependencies, SSA and usage tables
//! - [`opt`] - reduction and dead-code elimination
//! - [`codegen`] - instruction graph, register mapping, bubbling, frame, checker
//! - [`core`] - session, register file, errors and options

pub mod analysis;
pub mod codegen;
pub mod compiler;
pub mod core;
pub mod ir;
pub mod opt;

pub use crate::compiler::CompiledBlob;
pub use crate::core::{
    CompilationSession, CompileError, CompileOptions, CompileResult, PhysReg, RegBitSet, RegClass,
    SessionStats, VarSet,
};
pub use crate::codegen::{FrameLayout, OperatorMapping, Shuffle};
pub use crate::ir::{
    Addressing, ConstantEntry, OpIdx, Opcode, Operator, OperatorHandle, PoolIdx, Program, SpanIdx,
    VarId, VarType,
};
