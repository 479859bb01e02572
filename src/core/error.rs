// This module defines the error type for spanjit using the thiserror crate. CompileError covers
// the four ways a compilation can end early: the arena budget is exhausted (OutOfMemory), the
// dependency search proves that some operand is read on a path where no operator defines it
// (UninitializedVariable), an opcode reaches a phase that has no handler for it or is applied to
// the wrong register class (UnsupportedOperation), and a graph invariant is broken
// (InternalInconsistency). Every error is terminal for the compilation that raised it; there are
// no retries anywhere in the pipeline. CompileResult<T> is the usual alias.

//! Error types for the span compiler.

use crate::ir::{OpIdx, Opcode, VarId};
use thiserror::Error;

/// Main error type for a compilation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("Memory limit exceeded while allocating {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("Variable {var} read by operator {operator} is never initialized")]
    UninitializedVariable { var: VarId, operator: OpIdx },

    #[error("Unsupported operation: {opcode:?}")]
    UnsupportedOperation { opcode: Opcode },

    #[error("Internal inconsistency: {reason}")]
    InternalInconsistency { reason: String },
}

impl CompileError {
    pub fn internal(reason: impl Into<String>) -> Self {
        CompileError::InternalInconsistency {
            reason: reason.into(),
        }
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;
