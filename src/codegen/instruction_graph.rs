// This module materializes the dependency graph as instructions the register mapper can count
// down. Every operator gets one instruction at the same index. Values crossing a span boundary
// get explicit connector instructions: an input connector per (span, variable) read before any
// in-span producer, and an output connector per (span, variable) that a successor needs. Input
// connectors hook the output connectors of every predecessor span; an output connector hooks the
// last in-span producer or, when the span never writes the variable, the span's own input
// connector, which in turn asks its predecessors. New input connectors go on a worklist so the
// span-connecting pass runs until no new connector appears. Each instruction ends up with the
// number of live consumers the mapper decrements: operator hooks within the span plus the output
// connector when the value leaves the span.

//! Instruction graph with span connectors.

use crate::analysis::SpanGraph;
use crate::core::error::{CompileError, CompileResult};
use crate::ir::{OpIdx, Program, SpanIdx, VarId};
use hashbrown::HashMap;
use log::debug;
use std::collections::VecDeque;
use std::fmt;
use std::mem::size_of;

/// Index of an instruction; operators keep their own index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstIdx(pub u32);

impl InstIdx {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<OpIdx> for InstIdx {
    fn from(op: OpIdx) -> Self {
        InstIdx(op.0)
    }
}

impl fmt::Display for InstIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstKind {
    Operator(OpIdx),
    /// Value of `var` entering `span`.
    Input { span: SpanIdx, var: VarId },
    /// Value of `var` leaving `span`.
    Output { span: SpanIdx, var: VarId },
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub kind: InstKind,
    /// Sources read by this instruction, with the operand slot for operators.
    pub hooks: Vec<(u8, InstIdx)>,
    /// Operator and output-connector hooks pointing here.
    pub consumers: u32,
}

#[derive(Debug, Clone, Default)]
pub struct InstructionGraph {
    pub insts: Vec<Instruction>,
    inputs: HashMap<(SpanIdx, VarId), InstIdx>,
    outputs: HashMap<(SpanIdx, VarId), InstIdx>,
}

impl InstructionGraph {
    /// Build the graph and rewrite the span liveness sets from the connectors.
    pub fn build(program: &Program<'_>, graph: &mut SpanGraph) -> CompileResult<Self> {
        let mut builder = Builder {
            program,
            graph: &*graph,
            out: InstructionGraph::default(),
            worklist: VecDeque::new(),
        };
        builder.run()?;
        let out = builder.out;

        graph.clear_liveness();
        for &(span, var) in out.inputs.keys() {
            graph.span_mut(span).used_before.insert(var);
        }
        for &(span, var) in out.outputs.keys() {
            graph.span_mut(span).used_after.insert(var);
        }

        let connectors = out.connector_count();
        debug!(
            "instruction graph: {} instructions, {} connectors",
            out.insts.len(),
            connectors
        );
        program.session().record(|stats| stats.connectors = connectors);
        Ok(out)
    }

    pub fn inst(&self, idx: InstIdx) -> &Instruction {
        &self.insts[idx.index()]
    }

    pub fn input(&self, span: SpanIdx, var: VarId) -> Option<InstIdx> {
        self.inputs.get(&(span, var)).copied()
    }

    pub fn output(&self, span: SpanIdx, var: VarId) -> Option<InstIdx> {
        self.outputs.get(&(span, var)).copied()
    }

    pub fn connector_count(&self) -> usize {
        self.inputs.len() + self.outputs.len()
    }

    /// Instruction that operand `slot` of `op` reads.
    pub fn source(&self, op: OpIdx, slot: u8) -> Option<InstIdx> {
        self.insts
            .get(op.index())?
            .hooks
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, src)| *src)
    }

    /// Initial consumer counts, indexed by instruction.
    pub fn consumer_counts(&self) -> Vec<u32> {
        self.insts.iter().map(|inst| inst.consumers).collect()
    }
}

struct Builder<'g, 'p, 'a> {
    program: &'p Program<'a>,
    graph: &'g SpanGraph,
    out: InstructionGraph,
    worklist: VecDeque<InstIdx>,
}

impl Builder<'_, '_, '_> {
    fn run(&mut self) -> CompileResult<()> {
        let program = self.program;
        let ops = program.operators();
        for (i, op) in ops.iter().enumerate() {
            self.push(InstKind::Operator(OpIdx(i as u32)))?;
            if op.is_nop() {
                return Err(CompileError::internal(format!("nop left at #{}", i)));
            }
        }

        for (i, op) in ops.iter().enumerate() {
            let idx = OpIdx(i as u32);
            for (slot, var) in op.operand_slots() {
                let source = match program.nearest_producer_before(var, op.order) {
                    Some(p) if program.op(p).span == op.span => InstIdx::from(p),
                    _ => self.input(op.span, var)?,
                };
                self.hook(idx.into(), slot as u8, source);
            }
        }

        // Connect input connectors to their predecessors until nothing new appears.
        while let Some(input) = self.worklist.pop_front() {
            let InstKind::Input { span, var } = self.out.inst(input).kind else {
                continue;
            };
            for pred in self.graph.span(span).preds.clone() {
                let output = self.output(pred, var)?;
                self.out.insts[input.index()].hooks.push((0, output));
            }
        }
        Ok(())
    }

    fn push(&mut self, kind: InstKind) -> CompileResult<InstIdx> {
        self.program.session().charge(size_of::<Instruction>())?;
        let idx = InstIdx(self.out.insts.len() as u32);
        self.out.insts.push(Instruction {
            kind,
            hooks: Vec::new(),
            consumers: 0,
        });
        Ok(idx)
    }

    fn hook(&mut self, consumer: InstIdx, slot: u8, source: InstIdx) {
        self.out.insts[consumer.index()].hooks.push((slot, source));
        self.out.insts[source.index()].consumers += 1;
    }

    fn input(&mut self, span: SpanIdx, var: VarId) -> CompileResult<InstIdx> {
        if let Some(idx) = self.out.input(span, var) {
            return Ok(idx);
        }
        let idx = self.push(InstKind::Input { span, var })?;
        self.out.inputs.insert((span, var), idx);
        self.worklist.push_back(idx);
        Ok(idx)
    }

    fn output(&mut self, span: SpanIdx, var: VarId) -> CompileResult<InstIdx> {
        if let Some(idx) = self.out.output(span, var) {
            return Ok(idx);
        }
        let idx = self.push(InstKind::Output { span, var })?;
        self.out.outputs.insert((span, var), idx);
        let source = match self.program.last_producer_in_span(var, span) {
            Some(p) => InstIdx::from(p),
            None => self.input(span, var)?,
        };
        self.hook(idx, 0, source);
        Ok(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{build_dependencies, build_span_graph};
    use crate::core::session::CompilationSession;
    use crate::ir::{Opcode, VarType};
    use bumpalo::Bump;

    const N: VarId = VarId::NONE;

    #[test]
    fn test_straight_line_counts() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut program = Program::new(&session);
        let a = program.alloc_var(VarType::I64);
        let b = program.alloc_var(VarType::I64);
        program.add_operator(Opcode::Const, a, N, N, N); // 0
        program.add_operator(Opcode::Add, b, a, a, N); // 1
        program.add_operator(Opcode::Store64, N, a, N, b); // 2
        program.add_operator(Opcode::Return, N, N, N, N);

        let mut graph = build_span_graph(&mut program).unwrap();
        build_dependencies(&mut program, &mut graph).unwrap();
        let insts = InstructionGraph::build(&program, &mut graph).unwrap();

        assert_eq!(insts.connector_count(), 0);
        assert_eq!(insts.inst(InstIdx(0)).consumers, 3);
        assert_eq!(insts.inst(InstIdx(1)).consumers, 1);
        assert_eq!(insts.source(OpIdx(2), 2), Some(InstIdx(1)));
    }

    #[test]
    fn test_loop_connectors() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut program = Program::new(&session);
        let i = program.alloc_var(VarType::I64);
        let one = program.alloc_var(VarType::I64);
        program.add_operator(Opcode::Const, i, N, N, N); // 0
        program.add_operator(Opcode::Const, one, N, N, N); // 1
        program.add_operator(Opcode::LoopStart, N, N, N, N); // 2, span 0
        program.add_operator(Opcode::Sub, i, i, one, N); // 3
        program.add_operator(Opcode::LoopRepeat, N, i, N, N); // 4, span 1
        program.add_operator(Opcode::Return, N, N, N, N); // 5, span 2

        let mut graph = build_span_graph(&mut program).unwrap();
        build_dependencies(&mut program, &mut graph).unwrap();
        let insts = InstructionGraph::build(&program, &mut graph).unwrap();

        let body = SpanIdx(1);
        let input_i = insts.input(body, i).unwrap();
        let input_one = insts.input(body, one).unwrap();
        assert_eq!(insts.source(OpIdx(3), 0), Some(input_i));
        // The loop constant flows around the back edge, so it never dies in the body.
        assert_eq!(insts.inst(input_one).consumers, 2);
        assert_eq!(insts.inst(input_i).consumers, 1);
        // Sub feeds the repeat and the back edge.
        assert_eq!(insts.inst(InstIdx(3)).consumers, 2);
        assert_eq!(insts.inst(input_i).hooks.len(), 2);

        assert!(graph.spans[1].used_before.contains(i));
        assert!(graph.spans[1].used_after.contains(one));
        assert!(graph.spans[0].used_after.contains(one));
        assert!(!graph.spans[2].used_before.contains(i));
    }
}
