//! Helpers shared by the integration tests.

#![allow(dead_code)]

use spanjit::{CompiledBlob, Opcode, PhysReg, Program, Shuffle, VarId, VarType};

pub const N: VarId = VarId::NONE;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `p = const` followed by `count` loads through `p`.
pub fn loads_through_pointer(program: &mut Program<'_>, count: usize) -> (VarId, Vec<VarId>) {
    let p = program.alloc_var(VarType::Ptr);
    program.add_operator(Opcode::Const, p, N, N, N);
    let values = (0..count)
        .map(|_| {
            let v = program.alloc_var(VarType::I64);
            program.add_operator(Opcode::Load64, v, p, N, N);
            v
        })
        .collect();
    (p, values)
}

/// Store every value back through `p`, in order.
pub fn store_all(program: &mut Program<'_>, p: VarId, values: &[VarId]) {
    for &v in values {
        program.add_operator(Opcode::Store64, N, p, N, v);
    }
}

/// Index of the first operator with `opcode`.
pub fn find_op(blob: &CompiledBlob<'_>, opcode: Opcode) -> Option<usize> {
    blob.operators().iter().position(|op| op.opcode == opcode)
}

/// Every shuffle of the blob with the operator it is attached to.
pub fn shuffles(blob: &CompiledBlob<'_>) -> Vec<(usize, Shuffle)> {
    blob.mappings()
        .iter()
        .enumerate()
        .flat_map(|(i, m)| m.before.iter().chain(&m.back_edge).map(move |s| (i, *s)))
        .collect()
}

/// Whether `reg` shows up anywhere in the mapping.
pub fn uses_register(blob: &CompiledBlob<'_>, reg: PhysReg) -> bool {
    blob.mappings().iter().any(|m| {
        m.result == Some(reg)
            || m.operands.contains(&Some(reg))
            || m.before.iter().chain(&m.back_edge).any(|s| match *s {
                Shuffle::Save { reg: r, .. } | Shuffle::Load { reg: r, .. } => r == reg,
                Shuffle::Move { from, to, .. } => from == reg || to == reg,
                Shuffle::Swap { a, b } => a == reg || b == reg,
            })
    })
}

/// Small xorshift generator so program shapes are reproducible from a seed.
pub struct Rng(u64);

impl Rng {
    pub fn new(seed: u64) -> Self {
        Rng(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1)
    }

    pub fn next_u64(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    /// Uniform in `0..bound`.
    pub fn below(&mut self, bound: usize) -> usize {
        (self.next_u64() % bound as u64) as usize
    }

    pub fn pick(&mut self, vars: &[VarId]) -> VarId {
        vars[self.below(vars.len())]
    }
}

const RANDOM_OPCODES: [Opcode; 11] = [
    Opcode::Add,
    Opcode::Sub,
    Opcode::Mul,
    Opcode::Xor,
    Opcode::Div,
    Opcode::Rem,
    Opcode::Shl,
    Opcode::Shr,
    Opcode::Sar,
    Opcode::CallExt,
    Opcode::Load64,
];

/// A structured program of `length` operators built from `seed`: nested loops and branches up
/// to three deep, integer arithmetic including every fixed-register opcode, loads and stores.
/// Every value is defined before the first structure opens, so every read is initialized on
/// every path.
pub fn random_program(program: &mut Program<'_>, seed: u64, values: usize, length: usize) {
    let mut rng = Rng::new(seed);
    let p = program.alloc_var(VarType::Ptr);
    program.add_operator(Opcode::Const, p, N, N, N);
    let vars: Vec<_> = (0..values)
        .map(|_| {
            let v = program.alloc_var(VarType::I64);
            program.add_operator(Opcode::Const, v, N, N, N);
            v
        })
        .collect();

    let mut open = Vec::new();
    for _ in 0..length {
        match rng.below(10) {
            0 if open.len() < 3 => {
                program.add_operator(Opcode::LoopStart, N, N, N, N);
                open.push(Opcode::LoopRepeat);
            }
            1 if open.len() < 3 => {
                program.add_operator(Opcode::BranchSplit, N, rng.pick(&vars), N, N);
                open.push(Opcode::BranchMerge);
            }
            2 => {
                program.add_operator(Opcode::Store64, N, p, N, rng.pick(&vars));
                continue;
            }
            3 if !open.is_empty() => {
                close(program, &mut rng, &vars, &mut open);
                continue;
            }
            _ => {}
        }
        random_operator(program, &mut rng, p, &vars);
    }
    while !open.is_empty() {
        close(program, &mut rng, &vars, &mut open);
    }
    store_all(program, p, &vars);
}

fn random_operator(program: &mut Program<'_>, rng: &mut Rng, p: VarId, vars: &[VarId]) {
    let opcode = RANDOM_OPCODES[rng.below(RANDOM_OPCODES.len())];
    let result = rng.pick(vars);
    if opcode == Opcode::Load64 {
        program.add_operator(opcode, result, p, N, N);
    } else {
        program.add_operator(opcode, result, rng.pick(vars), rng.pick(vars), N);
    }
}

fn close(program: &mut Program<'_>, rng: &mut Rng, vars: &[VarId], open: &mut Vec<Opcode>) {
    match open.pop() {
        Some(Opcode::LoopRepeat) => {
            program.add_operator(Opcode::LoopRepeat, N, rng.pick(vars), N, N);
        }
        Some(closing) => {
            program.add_operator(closing, N, N, N, N);
        }
        None => {}
    }
}
