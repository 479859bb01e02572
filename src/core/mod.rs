// This module gathers the infrastructure every phase of spanjit shares. The session owns the
// bump arena, enforces the optional memory budget and collects statistics. The register file
// describes the x86-64 integer and vector registers, their classes and the bitsets and state
// snapshots the mapper and checker work with. VarSet is the growable bit vector behind every
// liveness set. Errors and options are plain data. Nothing in here knows about spans or links.

//! Core infrastructure shared by the analysis, optimization and mapping phases.

pub mod error;
pub mod options;
pub mod register_file;
pub mod session;
pub mod test_utils;
pub mod var_set;

pub use error::{CompileError, CompileResult};
pub use options::CompileOptions;
pub use register_file::{PhysReg, RegBitSet, RegClass, RegState, RegisterFile, CALLER_SAVED};
pub use session::{CompilationSession, SessionStats};
pub use var_set::VarSet;
