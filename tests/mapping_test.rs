// Register mapping seen from the outside: values never share a register, branches converge on
// one layout, and each compile option changes exactly the part of the output it is meant to.

mod common;

use bumpalo::Bump;
use common::*;
use spanjit::{
    CompilationSession, CompileError, CompileOptions, Opcode, PhysReg, Program, Shuffle, VarId,
    VarType,
};

/// `x` loaded before a branch, register pressure on the taken path, `x` read after the merge.
fn pressured_branch(program: &mut Program<'_>) -> VarId {
    let (p, head) = loads_through_pointer(program, 2);
    let (x, cond) = (head[0], head[1]);
    program.add_operator(Opcode::BranchSplit, N, cond, N, N);
    let values: Vec<_> = (0..15)
        .map(|_| {
            let v = program.alloc_var(VarType::I64);
            program.add_operator(Opcode::Load64, v, p, N, N);
            v
        })
        .collect();
    store_all(program, p, &values);
    program.add_operator(Opcode::BranchMerge, N, N, N, N);
    program.add_operator(Opcode::Store64, N, p, N, x);
    x
}

#[test]
fn test_operands_never_share_a_register() {
    init_logging();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut program = Program::new(&session);

    let (p, values) = loads_through_pointer(&mut program, 18);
    let sums: Vec<_> = values
        .windows(2)
        .map(|pair| {
            let s = program.alloc_var(VarType::I64);
            program.add_operator(Opcode::Sub, s, pair[0], pair[1], N);
            s
        })
        .collect();
    store_all(&mut program, p, &sums);
    store_all(&mut program, p, &values);

    let blob = program.compile(&CompileOptions::default()).unwrap();
    for (op, mapping) in blob.operators().iter().zip(blob.mappings()) {
        for (a, va) in op.operand_slots() {
            for (b, vb) in op.operand_slots() {
                if va != vb {
                    assert_ne!(mapping.operands[a], mapping.operands[b], "{:?}", op);
                }
            }
        }
    }
    blob.verify().unwrap();
}

#[test]
fn test_branch_merge_converges() {
    init_logging();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut program = Program::new(&session);
    let x = pressured_branch(&mut program);

    let blob = program.compile(&CompileOptions::default()).unwrap();
    let merge = find_op(&blob, Opcode::BranchMerge).unwrap();
    let store = merge + 1;
    assert_eq!(blob.operators()[store].operands[2], x);

    // The bypass path reaches the store without shuffles, so the taken path
    // must deliver x where the split left it.
    let split = find_op(&blob, Opcode::BranchSplit).unwrap();
    assert!(blob.mappings()[store].before.is_empty());
    assert!(blob.mappings()[split..merge]
        .iter()
        .any(|m| m.before.iter().any(|s| s.is_save())));
    blob.verify().unwrap();
}

#[test]
fn test_disabled_shuffling_rejects_diverging_merge() {
    init_logging();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut program = Program::new(&session);
    pressured_branch(&mut program);

    let options = CompileOptions::default().with_shuffling(false);
    assert!(matches!(
        program.compile(&options),
        Err(CompileError::InternalInconsistency { .. })
    ));
}

#[test]
fn test_frame_pointer_register_is_opt_in() {
    init_logging();
    for allow in [false, true] {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut program = Program::new(&session);
        let (p, values) = loads_through_pointer(&mut program, 20);
        store_all(&mut program, p, &values);

        let options = CompileOptions::default().with_frame_pointer_register(allow);
        let blob = program.compile(&options).unwrap();
        assert_eq!(uses_register(&blob, PhysReg::RBP), allow);
        assert!(!uses_register(&blob, PhysReg::RSP));
    }
}

#[test]
fn test_frame_offsets_follow_direction() {
    init_logging();
    for negative in [false, true] {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut program = Program::new(&session);
        let (p, values) = loads_through_pointer(&mut program, 20);
        store_all(&mut program, p, &values);

        let options = CompileOptions::default().with_negative_stack_offsets(negative);
        let blob = program.compile(&options).unwrap();
        let frame = blob.frame();
        assert!(!frame.is_empty());
        assert_eq!(frame.align_mask(), 7);
        assert_eq!(frame.size() as usize, 8 * frame.slot_count());
        assert_eq!(blob.stats().frame_size, frame.size());

        for var in &values {
            if let Some(offset) = blob.slot(*var) {
                if negative {
                    assert!(offset < 0 && offset >= -(frame.size() as i32));
                } else {
                    assert!(offset >= 0 && offset < frame.size() as i32);
                }
            }
        }
    }
}

/// `s = a + b` on vectors with both inputs read again afterwards.
fn vector_add(program: &mut Program<'_>) -> usize {
    let p = program.alloc_var(VarType::Ptr);
    let a = program.alloc_var(VarType::V128);
    let b = program.alloc_var(VarType::V128);
    let s = program.alloc_var(VarType::V128);
    program.add_operator(Opcode::Const, p, N, N, N);
    program.add_operator(Opcode::VecLoad128, a, p, N, N);
    program.add_operator(Opcode::VecLoad128, b, p, N, N);
    program.add_operator(Opcode::VecAdd32, s, a, b, N);
    program.add_operator(Opcode::VecStore128, N, p, N, s);
    program.add_operator(Opcode::VecStore128, N, p, N, a);
    program.add_operator(Opcode::VecStore128, N, p, N, b);
    3
}

#[test]
fn test_extended_simd_frees_the_result_register() {
    init_logging();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut program = Program::new(&session);
    let add = vector_add(&mut program);
    let blob = program.compile(&CompileOptions::default()).unwrap();
    let m = &blob.mappings()[add];
    assert_eq!(m.result, m.operands[0]);
    assert!(m
        .before
        .iter()
        .any(|s| matches!(s, Shuffle::Move { from, .. } if Some(*from) == m.operands[0])));

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut program = Program::new(&session);
    let add = vector_add(&mut program);
    let options = CompileOptions::default().with_extended_simd_isa(true);
    let blob = program.compile(&options).unwrap();
    let m = &blob.mappings()[add];
    assert_ne!(m.result, m.operands[0]);
    assert_ne!(m.result, m.operands[1]);
    assert!(m.before.is_empty());
    assert_eq!(blob.stats().moves, 0);
}

#[test]
fn test_avoid_narrow_moves_widens_copies() {
    init_logging();
    for (avoid, width) in [(false, 4), (true, 8)] {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut program = Program::new(&session);
        let p = program.alloc_var(VarType::Ptr);
        let a = program.alloc_var(VarType::I32);
        let b = program.alloc_var(VarType::I32);
        let s = program.alloc_var(VarType::I32);
        program.add_operator(Opcode::Const, p, N, N, N);
        program.add_operator(Opcode::Load32, a, p, N, N);
        program.add_operator(Opcode::Load32, b, p, N, N);
        program.add_operator(Opcode::Add, s, a, b, N);
        program.add_operator(Opcode::Store32, N, p, N, s);
        program.add_operator(Opcode::Store32, N, p, N, a);
        program.add_operator(Opcode::Store32, N, p, N, b);

        let options = CompileOptions::default().with_avoid_narrow_moves(avoid);
        let blob = program.compile(&options).unwrap();
        let moves: Vec<_> = shuffles(&blob)
            .into_iter()
            .filter_map(|(_, s)| match s {
                Shuffle::Move { var, width, .. } => Some((var, width)),
                _ => None,
            })
            .collect();
        assert_eq!(moves, vec![(a, width)]);
    }
}

#[test]
fn test_total_bubbling_moves_saves_up() {
    init_logging();
    let save_sites = |bubbling: bool| {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut program = Program::new(&session);
        let (p, mut values) = loads_through_pointer(&mut program, 20);
        // Oldest values are read last, so they are the ones evicted.
        values.reverse();
        store_all(&mut program, p, &values);

        let options = CompileOptions::default().with_total_bubbling(bubbling);
        let blob = program.compile(&options).unwrap();
        blob.verify().unwrap();
        let mut sites: Vec<_> = shuffles(&blob)
            .into_iter()
            .filter_map(|(at, s)| match s {
                Shuffle::Save { var, .. } => Some((var, at)),
                _ => None,
            })
            .collect();
        sites.sort();
        sites
    };

    let plain = save_sites(false);
    let bubbled = save_sites(true);
    assert_eq!(plain.len(), bubbled.len());
    assert!(!plain.is_empty());
    for ((var, late), (same, early)) in plain.iter().zip(&bubbled) {
        assert_eq!(var, same);
        assert!(early <= late);
    }
    assert!(plain.iter().zip(&bubbled).any(|(a, b)| b.1 < a.1));
}
