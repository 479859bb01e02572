// This module drives one compilation from a finished Program to a CompiledBlob. The phases run
// in a fixed order and each one leaves the program in the shape the next expects: the span graph
// numbers operators and spans, the dependency builder links every operand to its providers, the
// SSA pass splits variables written twice in one span, reduction and dead-code elimination
// alternate until neither finds work, the instruction graph adds span connectors and recomputes
// liveness, the mapper assigns registers and shuffles, optional bubbling moves saves up, and the
// frame allocator gives every saved variable a slot. Debug builds finish by replaying the mapped
// program through the checker. Any error ends the compilation; the program is consumed either way.

//! Compile driver and compiled output.

use crate::analysis::{
    build_dependencies, build_span_graph, check_ssa, convert_to_ssa, SpanGraph, UsageTable,
};
use crate::codegen::{
    bubble_saves, map_registers, verify, FrameLayout, InstructionGraph, OperatorMapping,
    RegisterMap,
};
use crate::core::error::CompileResult;
use crate::core::options::CompileOptions;
use crate::core::register_file::PhysReg;
use crate::core::session::SessionStats;
use crate::ir::{ConstantEntry, OpIdx, Operator, Program, VarId, VarType};
use crate::opt::optimize;
use log::debug;

/// Register-mapped program handed to the encoder.
#[derive(Debug)]
pub struct CompiledBlob<'a> {
    operators: Vec<Operator>,
    mappings: Vec<OperatorMapping>,
    spans: SpanGraph,
    frame: FrameLayout,
    constants: Vec<ConstantEntry<'a>>,
    var_types: Vec<VarType>,
    stats: SessionStats,
}

impl<'a> Program<'a> {
    /// Run every phase and produce the mapped program.
    ///
    /// Errors deferred during emission (out of memory, unclosed structures)
    /// are reported here before any phase runs.
    pub fn compile(mut self, options: &CompileOptions) -> CompileResult<CompiledBlob<'a>> {
        if let Some(err) = self.emission_error() {
            return Err(err);
        }
        let session = self.session();
        if let Some(limit) = options.memory_limit {
            session.set_memory_limit(Some(limit));
        }

        self.ensure_return()?;
        let mut graph = build_span_graph(&mut self)?;
        build_dependencies(&mut self, &mut graph)?;
        convert_to_ssa(&mut self, &mut graph)?;
        optimize(&mut self, &mut graph)?;
        if cfg!(debug_assertions) {
            check_ssa(&self)?;
        }

        let insts = InstructionGraph::build(&self, &mut graph)?;
        let usage = UsageTable::build(&self);
        let RegisterMap {
            mut mappings,
            saved,
        } = map_registers(&self, &graph, &insts, &usage, options)?;
        if options.enable_total_bubbling {
            bubble_saves(&self.ops, &mut mappings, &graph);
        }
        let frame = FrameLayout::build(&self, &saved, options.use_negative_stack_offsets);

        if cfg!(debug_assertions) {
            verify(&self.ops, &mappings, &graph)?;
        }
        debug!(
            "compiled {} operators in {} spans, frame {} bytes",
            self.ops.len(),
            graph.len(),
            frame.size()
        );

        let var_types = self.vars.iter().map(|var| var.ty).collect();
        Ok(CompiledBlob {
            operators: self.ops,
            mappings,
            spans: graph,
            frame,
            constants: self.constants,
            var_types,
            stats: session.stats(),
        })
    }
}

impl<'a> CompiledBlob<'a> {
    pub fn operators(&self) -> &[Operator] {
        &self.operators
    }

    pub fn mappings(&self) -> &[OperatorMapping] {
        &self.mappings
    }

    pub fn mapping(&self, op: OpIdx) -> Option<&OperatorMapping> {
        self.mappings.get(op.index())
    }

    pub fn spans(&self) -> &SpanGraph {
        &self.spans
    }

    pub fn frame(&self) -> &FrameLayout {
        &self.frame
    }

    pub fn constants(&self) -> &[ConstantEntry<'a>] {
        &self.constants
    }

    pub fn var_type(&self, var: VarId) -> Option<VarType> {
        if var.is_none() {
            return None;
        }
        self.var_types.get(var.index()).copied()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Frame offset of a saved variable.
    pub fn slot(&self, var: VarId) -> Option<i32> {
        self.frame.offset(var)
    }

    /// Concrete register for the encoder.
    pub fn register(&self, reg: PhysReg) -> iced_x86::Register {
        reg.to_register()
    }

    /// Replay the mapping and report the first operand that would read a wrong value.
    pub fn verify(&self) -> CompileResult<()> {
        verify(&self.operators, &self.mappings, &self.spans)
    }
}
