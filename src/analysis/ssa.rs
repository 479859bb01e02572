//! Per-span single assignment.
//!
//! Spans are already the unit of single assignment, so no phi construction
//! is needed: whenever two producers of one variable share a span, the
//! program-earlier one is given a fresh variable. Its value is overwritten
//! before the span ends, so every consumer of it sits in the same span and
//! is rewired to the new id.

use super::span_graph::SpanGraph;
use crate::core::error::{CompileError, CompileResult};
use crate::ir::{OpIdx, Program, VarId};
use log::{debug, trace};

/// Split shared producers; returns the number of variables created.
pub fn convert_to_ssa(program: &mut Program<'_>, graph: &mut SpanGraph) -> CompileResult<usize> {
    let original = program.var_count() as u32;
    let mut created = 0;

    // Highest id first; fresh ids are never revisited.
    for id in (1..original).rev() {
        let var = VarId(id);
        loop {
            let Some((later, earlier)) = shared_producers(program, var) else {
                break;
            };
            let fresh = program.new_var(program.ty(var))?;
            trace!("{}: {} shares its span with {}, renamed to {}", var, earlier, later, fresh);
            rename_producer(program, graph, earlier, fresh)?;
            created += 1;
        }
    }

    debug!("ssa: {} variables split", created);
    Ok(created)
}

/// First pair of adjacent chain entries that live in the same span.
fn shared_producers(program: &Program<'_>, var: VarId) -> Option<(OpIdx, OpIdx)> {
    let mut chain = program.producers(var);
    let mut prev = chain.next()?;
    for cur in chain {
        if program.op(cur).span == program.op(prev).span {
            return Some((prev, cur));
        }
        prev = cur;
    }
    None
}

fn rename_producer(
    program: &mut Program<'_>,
    graph: &mut SpanGraph,
    producer: OpIdx,
    fresh: VarId,
) -> CompileResult<()> {
    let span = program.op(producer).span;
    program.set_result(producer, fresh);
    graph.span_mut(span).changed.insert(fresh);

    for idx in program.links.consumer_links(producer) {
        let link = program.links.get(idx).clone();
        if program.op(link.consumer).span != span {
            return Err(CompileError::internal(format!(
                "overwritten value of {} escapes its span to {}",
                producer, link.consumer
            )));
        }
        program.op_mut(link.consumer).operands[link.slot as usize] = fresh;
        graph.span_mut(span).used.insert(fresh);
    }
    Ok(())
}

/// At most one producer per (variable, span).
pub fn check_ssa(program: &Program<'_>) -> CompileResult<()> {
    for id in 1..program.var_count() as u32 {
        if let Some((later, earlier)) = shared_producers(program, VarId(id)) {
            return Err(CompileError::internal(format!(
                "v{} produced twice in one span by {} and {}",
                id, earlier, later
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::dependency::build_dependencies;
    use crate::analysis::span_graph::build_span_graph;
    use crate::core::session::CompilationSession;
    use crate::ir::{Opcode, VarType};
    use bumpalo::Bump;

    const N: VarId = VarId::NONE;

    #[test]
    fn test_split_shared_producer() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut program = Program::new(&session);
        let x = program.alloc_var(VarType::I64);
        let y = program.alloc_var(VarType::I64);
        program.add_operator(Opcode::Const, x, N, N, N); // 0
        program.add_operator(Opcode::Add, x, x, x, N); // 1
        program.add_operator(Opcode::Mov, y, x, N, N); // 2
        program.add_operator(Opcode::Return, N, N, N, N);

        let mut graph = build_span_graph(&mut program).unwrap();
        build_dependencies(&mut program, &mut graph).unwrap();
        assert!(check_ssa(&program).is_err());

        let created = convert_to_ssa(&mut program, &mut graph).unwrap();
        assert_eq!(created, 1);
        check_ssa(&program).unwrap();

        // The constant now writes a fresh variable that the add reads twice.
        let fresh = program.ops[0].result;
        assert_ne!(fresh, x);
        assert_eq!(program.ops[1].operands, [fresh, fresh, N]);
        assert_eq!(program.ops[1].result, x);
        assert_eq!(program.ops[2].operands[0], x);
        assert_eq!(program.var_type(fresh), Some(VarType::I64));
        program.links().verify().unwrap();
    }

    #[test]
    fn test_three_producers_in_one_span() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut program = Program::new(&session);
        let x = program.alloc_var(VarType::I32);
        program.add_operator(Opcode::Const, x, N, N, N);
        program.add_operator(Opcode::Not, x, x, N, N);
        program.add_operator(Opcode::Not, x, x, N, N);
        program.add_operator(Opcode::Store32, N, x, x, x);
        program.add_operator(Opcode::Return, N, N, N, N);

        let mut graph = build_span_graph(&mut program).unwrap();
        build_dependencies(&mut program, &mut graph).unwrap();
        assert_eq!(convert_to_ssa(&mut program, &mut graph).unwrap(), 2);
        check_ssa(&program).unwrap();
        assert_eq!(program.ops[2].result, x);
        assert_eq!(program.ops[1].result, program.ops[2].operands[0]);
    }
}
