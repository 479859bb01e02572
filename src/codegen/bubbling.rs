//! Save bubbling.
//!
//! A save emitted at eviction time sits right before the operator that
//! needed the register. Moving it up to just after the operator that last
//! wrote the register shortens nothing at run time by itself but lets the
//! encoder overlap the store with the work in between. Saves never leave
//! their span and never pass another write of their register.

use super::mapper::{OperatorMapping, Shuffle};
use crate::analysis::SpanGraph;
use crate::core::register_file::PhysReg;
use crate::ir::{Operator, VarId};
use log::{debug, trace};

/// Move every non-hoisted save up to the last write of its register; returns how many moved.
pub fn bubble_saves(ops: &[Operator], mappings: &mut [OperatorMapping], graph: &SpanGraph) -> usize {
    let mut moved = 0;
    for x in 0..mappings.len() {
        let first = graph.span(ops[x].span).first as usize;
        let mut k = 0;
        while k < mappings[x].before.len() {
            let shuffle = mappings[x].before[k];
            let Shuffle::Save {
                var,
                reg,
                hoisted: false,
                ..
            } = shuffle
            else {
                k += 1;
                continue;
            };
            let Some(writer) = last_write(ops, mappings, first, x, k, reg, var) else {
                k += 1;
                continue;
            };
            let dest = writer + 1;
            if dest == x && k == 0 {
                k += 1;
                continue;
            }
            trace!("bubble {} from #{} to #{}", shuffle, x, dest);
            mappings[x].before.remove(k);
            mappings[dest].before.insert(0, shuffle);
            moved += 1;
            if dest == x {
                k += 1;
            }
        }
    }
    debug!("bubbling: {} saves moved", moved);
    moved
}

/// Operator in `first..x` that last wrote `reg`, provided it wrote `var`
/// there and nothing wrote `reg` since.
fn last_write(
    ops: &[Operator],
    mappings: &[OperatorMapping],
    first: usize,
    x: usize,
    k: usize,
    reg: PhysReg,
    var: VarId,
) -> Option<usize> {
    let writes = |shuffles: &[Shuffle]| shuffles.iter().any(|s| s.writes().contains(reg));
    if writes(&mappings[x].before[..k]) {
        return None;
    }
    for w in (first..x).rev() {
        let mapping = &mappings[w];
        if mapping.result == Some(reg) {
            return (ops[w].result == var).then_some(w);
        }
        if mapping.clobbers.contains(reg) || writes(&mapping.before) {
            return None;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::build_span_graph;
    use crate::core::register_file::RegBitSet;
    use crate::core::session::CompilationSession;
    use crate::ir::{Opcode, Program, VarType};
    use bumpalo::Bump;

    const N: VarId = VarId::NONE;

    fn save(var: VarId, reg: PhysReg) -> Shuffle {
        Shuffle::Save {
            var,
            reg,
            width: 8,
            hoisted: false,
        }
    }

    fn setup<'a>(session: &'a CompilationSession<'a>) -> (Program<'a>, [VarId; 3]) {
        let mut program = Program::new(session);
        let a = program.alloc_var(VarType::I64);
        let b = program.alloc_var(VarType::I64);
        let c = program.alloc_var(VarType::I64);
        program.add_operator(Opcode::Const, a, N, N, N); // 0
        program.add_operator(Opcode::Const, b, N, N, N); // 1
        program.add_operator(Opcode::Add, c, b, b, N); // 2
        program.add_operator(Opcode::Store64, N, b, N, c); // 3
        program.add_operator(Opcode::Return, N, N, N, N); // 4
        (program, [a, b, c])
    }

    fn mappings() -> Vec<OperatorMapping> {
        let mut m = vec![OperatorMapping::default(); 5];
        m[0].result = Some(PhysReg::RBX);
        m[1].result = Some(PhysReg::RCX);
        m[2].result = Some(PhysReg::RCX);
        m
    }

    #[test]
    fn test_save_moves_to_last_write() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let (mut program, [a, ..]) = setup(&session);
        let graph = build_span_graph(&mut program).unwrap();

        let mut m = mappings();
        m[3].before.push(save(a, PhysReg::RBX));
        assert_eq!(bubble_saves(program.operators(), &mut m, &graph), 1);
        assert!(m[3].before.is_empty());
        assert_eq!(m[1].before, vec![save(a, PhysReg::RBX)]);

        // Already in place.
        assert_eq!(bubble_saves(program.operators(), &mut m, &graph), 0);
    }

    #[test]
    fn test_intervening_write_blocks() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let (mut program, [a, b, _]) = setup(&session);
        let graph = build_span_graph(&mut program).unwrap();

        let mut m = mappings();
        m[2].clobbers = RegBitSet::of(&[PhysReg::RBX]);
        m[3].before.push(save(a, PhysReg::RBX));
        assert_eq!(bubble_saves(program.operators(), &mut m, &graph), 0);
        assert_eq!(m[3].before.len(), 1);

        // A result of another variable in the register blocks as well.
        let mut m = mappings();
        m[3].before.push(save(b, PhysReg::RBX));
        assert_eq!(bubble_saves(program.operators(), &mut m, &graph), 0);
    }

    #[test]
    fn test_hoisted_saves_stay() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let (mut program, [a, ..]) = setup(&session);
        let graph = build_span_graph(&mut program).unwrap();

        let mut m = mappings();
        let hoisted = Shuffle::Save {
            var: a,
            reg: PhysReg::RBX,
            width: 8,
            hoisted: true,
        };
        m[3].before.push(hoisted);
        assert_eq!(bubble_saves(program.operators(), &mut m, &graph), 0);
        assert_eq!(m[3].before, vec![hoisted]);
    }
}
