// This module partitions the operator sequence into spans (basic blocks) and links them into a
// graph. A span is a maximal run of operators ended by a control operator; the implicit Return
// appended by compile guarantees the last span is terminated. Edges follow the structure the
// front end declared: fallthrough into the next span (except after Return, SubCall, SubReturn
// and SubStart, whose bodies are only entered through calls), a bypass edge from a branch split
// to the span after its merge, a back edge from a loop repeat to the span after its loop start,
// and for subroutines an edge from the call into the body plus one from every return back to the
// span after the call. Each span also records its nesting depth (loops and subroutine bodies)
// and the four per-variable bit vectors filled in by the dependency builder.

//! Span graph construction.

use crate::core::error::{CompileError, CompileResult};
use crate::core::var_set::VarSet;
use crate::ir::{ControlKind, OpIdx, Program, SpanIdx};
use log::debug;

/// A basic block: operators `first..=last`, ended by the control operator at `last`.
#[derive(Debug, Clone, Default)]
pub struct Span {
    pub first: u32,
    pub last: u32,
    /// Loop and subroutine depth at the first operator.
    pub nesting: u32,
    pub preds: Vec<SpanIdx>,
    pub succs: Vec<SpanIdx>,
    /// Variables whose value enters the span from a predecessor.
    pub used_before: VarSet,
    /// Variables whose value leaves the span to a successor.
    pub used_after: VarSet,
    /// Variables written in the span.
    pub changed: VarSet,
    /// Variables read in the span.
    pub used: VarSet,
}

impl Span {
    pub fn len(&self) -> u32 {
        self.last - self.first + 1
    }

    pub fn contains(&self, op: OpIdx) -> bool {
        (self.first..=self.last).contains(&op.0)
    }

    pub fn ops(&self) -> impl Iterator<Item = OpIdx> {
        (self.first..=self.last).map(OpIdx)
    }
}

/// All spans of a program in program order.
#[derive(Debug, Clone, Default)]
pub struct SpanGraph {
    pub spans: Vec<Span>,
}

impl SpanGraph {
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn span(&self, idx: SpanIdx) -> &Span {
        &self.spans[idx.index()]
    }

    pub fn span_mut(&mut self, idx: SpanIdx) -> &mut Span {
        &mut self.spans[idx.index()]
    }

    pub fn indices(&self) -> impl Iterator<Item = SpanIdx> {
        (0..self.spans.len() as u32).map(SpanIdx)
    }

    /// Add `from -> to` to both edge lists, ignoring duplicates.
    pub fn add_edge(&mut self, from: SpanIdx, to: SpanIdx) {
        if self.spans[from.index()].succs.contains(&to) {
            return;
        }
        self.spans[from.index()].succs.push(to);
        self.spans[to.index()].preds.push(from);
    }

    /// Forget the liveness bit vectors.
    pub fn clear_liveness(&mut self) {
        for span in &mut self.spans {
            span.used_before.clear();
            span.used_after.clear();
            span.changed.clear();
            span.used.clear();
        }
    }
}

/// Partition `program` into spans and connect them.
pub fn build_span_graph(program: &mut Program<'_>) -> CompileResult<SpanGraph> {
    let mut graph = SpanGraph::default();
    let var_count = program.var_count();

    // Pass 1: boundaries, span indices and nesting.
    let mut first = 0u32;
    let mut nesting = 0u32;
    let mut span_nesting = 0u32;
    for i in 0..program.ops.len() {
        let span = SpanIdx(graph.spans.len() as u32);
        let op = &mut program.ops[i];
        op.order = i as u32;
        op.span = span;
        let Some(kind) = op.opcode.info().control else {
            continue;
        };
        graph.spans.push(Span {
            first,
            last: i as u32,
            nesting: span_nesting,
            used_before: VarSet::with_capacity(var_count),
            used_after: VarSet::with_capacity(var_count),
            changed: VarSet::with_capacity(var_count),
            used: VarSet::with_capacity(var_count),
            ..Span::default()
        });
        match kind {
            ControlKind::LoopStart | ControlKind::SubStart => nesting += 1,
            ControlKind::LoopRepeat | ControlKind::SubReturn => {
                nesting = nesting.checked_sub(1).ok_or_else(|| {
                    CompileError::internal(format!("unbalanced {} at #{}", op.opcode.name(), i))
                })?
            }
            _ => {}
        }
        span_nesting = nesting;
        first = i as u32 + 1;
    }
    if first as usize != program.ops.len() {
        return Err(CompileError::internal("program does not end in a control operator"));
    }

    // Pass 2: edges.
    let span_of = |program: &Program<'_>, op: OpIdx| program.op(op).span;
    let partner = |program: &Program<'_>, op: OpIdx| -> CompileResult<OpIdx> {
        program.op(op).linked.ok_or_else(|| {
            CompileError::internal(format!(
                "{} at {} has no structural partner",
                program.op(op).opcode.name(),
                op
            ))
        })
    };
    let count = graph.spans.len() as u32;
    let after = |span: SpanIdx| -> CompileResult<SpanIdx> {
        if span.0 + 1 < count {
            Ok(SpanIdx(span.0 + 1))
        } else {
            Err(CompileError::internal(format!("no span follows {}", span)))
        }
    };

    for s in 0..count {
        let span = SpanIdx(s);
        let last = OpIdx(graph.spans[s as usize].last);
        let kind = program.op(last).opcode.info().control;

        let falls_through = !matches!(
            kind,
            Some(
                ControlKind::Return
                    | ControlKind::SubCall
                    | ControlKind::SubReturn
                    | ControlKind::SubStart
            )
        );
        if falls_through {
            graph.add_edge(span, after(span)?);
        }

        match kind {
            Some(ControlKind::BranchSplit) => {
                let merge = partner(program, last)?;
                graph.add_edge(span, after(span_of(program, merge))?);
            }
            Some(ControlKind::LoopRepeat) => {
                let start = partner(program, last)?;
                graph.add_edge(span, after(span_of(program, start))?);
            }
            Some(ControlKind::LoopStart) | Some(ControlKind::BranchMerge) => {
                partner(program, last)?;
            }
            Some(ControlKind::SubCall) => {
                let start = partner(program, last)?;
                let body = after(span_of(program, start))?;
                graph.add_edge(span, body);
                let ret = partner(program, start)?;
                graph.add_edge(span_of(program, ret), after(span)?);
            }
            Some(ControlKind::SubStart) => {
                // The body is entered through calls; this span only anchors it.
                partner(program, last)?;
            }
            _ => {}
        }
    }

    debug!(
        "span graph: {} spans, {} edges",
        graph.spans.len(),
        graph.spans.iter().map(|s| s.succs.len()).sum::<usize>()
    );
    program.session().record(|stats| stats.spans = graph.spans.len());
    Ok(graph)
}
