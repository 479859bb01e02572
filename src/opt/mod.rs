//! Optimizer: peephole reduction and dead-code elimination.

pub mod dce;
pub mod reduce;

pub use dce::eliminate_dead_code;
pub use reduce::reduce;

use crate::analysis::SpanGraph;
use crate::core::error::CompileResult;
use crate::ir::Program;
use log::debug;

/// Alternate reduction and dead-code elimination until neither changes anything.
pub fn optimize(program: &mut Program<'_>, graph: &mut SpanGraph) -> CompileResult<()> {
    let mut rounds = 0;
    loop {
        rounds += 1;
        let rewrites = reduce(program, graph)?;
        let removed = eliminate_dead_code(program, graph)?;
        if rewrites == 0 && removed == 0 {
            break;
        }
    }
    debug!("optimize: fixed point after {} rounds", rounds);
    Ok(())
}
