//! Dead-code elimination.
//!
//! Mark and sweep over the dependency graph. Operators with an observable
//! effect seed the mark; marking follows provider links with an explicit
//! stack. The sweep kills everything unmarked and compacts the operator
//! table, renumbering every stored operator index on the way.

use crate::analysis::SpanGraph;
use crate::core::error::{CompileError, CompileResult};
use crate::ir::{Addressing, OpFlags, OpIdx, Program};
use log::{debug, trace};

/// Remove unused operators; returns how many were eliminated.
pub fn eliminate_dead_code(program: &mut Program<'_>, graph: &mut SpanGraph) -> CompileResult<usize> {
    mark(program);

    let mut dead = 0;
    for i in 0..program.ops.len() {
        let op = &program.ops[i];
        if !op.is_nop() && !op.flags.contains(OpFlags::IN_USE) {
            program.kill(OpIdx(i as u32));
            dead += 1;
        }
    }

    let before = program.ops.len();
    compact(program, graph)?;
    debug!(
        "dce: {} operators eliminated, {} -> {} operators",
        dead,
        before,
        program.ops.len()
    );
    program
        .session()
        .record(|stats| stats.operators_eliminated += dead);
    Ok(dead)
}

fn mark(program: &mut Program<'_>) {
    let mut stack = Vec::new();
    for (i, op) in program.ops.iter_mut().enumerate() {
        op.flags.remove(OpFlags::IN_USE);
        if op.is_nop() {
            continue;
        }
        let info = op.info();
        if info.side_effect || info.control.is_some() || op.flags.contains(OpFlags::VOLATILE) {
            op.flags.insert(OpFlags::IN_USE);
            stack.push(OpIdx(i as u32));
        }
    }

    while let Some(op) = stack.pop() {
        let providers: Vec<OpIdx> = program
            .links
            .providers(op)
            .map(|(_, link)| link.provider)
            .collect();
        for provider in providers {
            let flags = &mut program.ops[provider.index()].flags;
            if !flags.contains(OpFlags::IN_USE) {
                flags.insert(OpFlags::IN_USE);
                stack.push(provider);
            }
        }
    }
}

/// Drop every `Nop` and renumber.
fn compact(program: &mut Program<'_>, graph: &mut SpanGraph) -> CompileResult<()> {
    let mut map = vec![None; program.ops.len()];
    let mut kept = Vec::with_capacity(program.ops.len());
    for (i, op) in std::mem::take(&mut program.ops).into_iter().enumerate() {
        if op.is_nop() {
            continue;
        }
        map[i] = Some(OpIdx(kept.len() as u32));
        kept.push(op);
    }

    let remap = |idx: Option<OpIdx>, what: &str| -> CompileResult<Option<OpIdx>> {
        match idx {
            None => Ok(None),
            Some(old) => map
                .get(old.index())
                .copied()
                .flatten()
                .map(Some)
                .ok_or_else(|| CompileError::internal(format!("{} {} was removed", what, old))),
        }
    };

    for (i, op) in kept.iter_mut().enumerate() {
        op.order = i as u32;
        op.flags.remove(OpFlags::IN_USE);
        op.linked = remap(op.linked, "structural partner")?;
        op.next_producer = remap(op.next_producer, "producer")?;
    }
    for var in program.vars.iter_mut() {
        var.producer_head = remap(var.producer_head, "producer")?;
    }
    program.links.remap(&map, kept.len())?;

    let mut first = 0;
    for span in graph.spans.iter_mut() {
        let last = remap(Some(OpIdx(span.last)), "span terminator")?
            .ok_or_else(|| CompileError::internal("span lost its terminator"))?;
        span.first = first;
        span.last = last.0;
        first = last.0 + 1;
    }
    if first as usize != kept.len() {
        return Err(CompileError::internal(format!(
            "spans cover {} of {} operators after compaction",
            first,
            kept.len()
        )));
    }

    for entry in program.constants.iter_mut() {
        entry.refs = 0;
    }
    for op in &kept {
        let static_pool = match op.addressing {
            Addressing::Static { pool, .. } => Some(pool),
            _ => None,
        };
        for pool in op.pool.into_iter().chain(static_pool) {
            if let Some(entry) = program.constants.get_mut(pool.0 as usize) {
                entry.refs += 1;
            }
        }
    }
    trace!(
        "constant pool refs after compaction: {:?}",
        program.constants.iter().map(|c| c.refs).collect::<Vec<_>>()
    );

    program.ops = kept;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{build_dependencies, build_span_graph};
    use crate::core::session::CompilationSession;
    use crate::ir::{Opcode, VarId, VarType};
    use bumpalo::Bump;

    const N: VarId = VarId::NONE;

    #[test]
    fn test_unused_result_is_removed() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut program = Program::new(&session);
        let p = program.alloc_var(VarType::Ptr);
        let a = program.alloc_var(VarType::I64);
        let dead = program.alloc_var(VarType::I64);
        program.add_operator(Opcode::Const, p, N, N, N); // 0
        program.add_operator(Opcode::Load64, a, p, N, N); // 1
        program.add_operator(Opcode::Add, dead, a, a, N); // 2
        program.add_operator(Opcode::Boundary, N, N, N, N); // 3
        program.add_operator(Opcode::Store64, N, p, N, a); // 4
        program.add_operator(Opcode::Return, N, N, N, N); // 5

        let mut graph = build_span_graph(&mut program).unwrap();
        build_dependencies(&mut program, &mut graph).unwrap();
        assert_eq!(eliminate_dead_code(&mut program, &mut graph).unwrap(), 1);

        assert_eq!(program.ops.len(), 5);
        assert!(program.ops.iter().all(|op| op.result != dead));
        assert_eq!(program.producer_count(dead), 0);
        assert_eq!((graph.spans[0].first, graph.spans[0].last), (0, 2));
        assert_eq!((graph.spans[1].first, graph.spans[1].last), (3, 4));
        assert_eq!(program.links().providers_for_slot(OpIdx(3), 2), vec![OpIdx(1)]);
        assert!(program.ops.iter().enumerate().all(|(i, op)| op.order == i as u32));
        program.links().verify().unwrap();
    }

    #[test]
    fn test_idempotent() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut program = Program::new(&session);
        let x = program.alloc_var(VarType::I64);
        let y = program.alloc_var(VarType::I64);
        program.add_operator(Opcode::Const, x, N, N, N);
        program.add_operator(Opcode::Const, y, N, N, N);
        program.add_operator(Opcode::Mul, y, y, y, N);
        program.add_operator(Opcode::LoopStart, N, N, N, N);
        program.add_operator(Opcode::Sub, x, x, x, N);
        program.add_operator(Opcode::LoopRepeat, N, x, N, N);
        program.add_operator(Opcode::Return, N, N, N, N);

        let mut graph = build_span_graph(&mut program).unwrap();
        build_dependencies(&mut program, &mut graph).unwrap();
        assert_eq!(eliminate_dead_code(&mut program, &mut graph).unwrap(), 2);
        let survivors: Vec<Opcode> = program.ops.iter().map(|op| op.opcode).collect();

        assert_eq!(eliminate_dead_code(&mut program, &mut graph).unwrap(), 0);
        let again: Vec<Opcode> = program.ops.iter().map(|op| op.opcode).collect();
        assert_eq!(survivors, again);
        // Partners survive renumbering.
        assert_eq!(program.ops[1].linked, Some(OpIdx(3)));
    }

    #[test]
    fn test_volatile_and_constant_refs() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut program = Program::new(&session);
        let kept = program.alloc_var(VarType::V128);
        let gone = program.alloc_var(VarType::V128);
        let h = program.add_operator(Opcode::Const, kept, N, N, N);
        program.attach_constant(h, &[7; 16]);
        program.set_volatile(h);
        let g = program.add_operator(Opcode::Const, gone, N, N, N);
        program.attach_constant(g, &[9; 16]);
        program.add_operator(Opcode::Return, N, N, N, N);

        let mut graph = build_span_graph(&mut program).unwrap();
        build_dependencies(&mut program, &mut graph).unwrap();
        eliminate_dead_code(&mut program, &mut graph).unwrap();
        assert_eq!(program.ops.len(), 2);
        assert_eq!(program.constants()[0].refs, 1);
        assert_eq!(program.constants()[1].refs, 0);
    }
}
