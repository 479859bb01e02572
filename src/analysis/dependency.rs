//! Dependency graph construction.
//!
//! Every operand gets linked to the operator(s) that may produce its value.
//! A producer earlier in the same span wins outright; otherwise the value
//! flows in through the span graph and a worklist search over predecessor
//! spans collects every span that produces it, filling in the liveness bit
//! vectors (`used_before`, `used_after`) of the spans it passes through.

use super::span_graph::SpanGraph;
use crate::core::error::{CompileError, CompileResult};
use crate::ir::{OpIdx, Opcode, Program, SpanIdx, VarId};
use log::{debug, trace};
use std::collections::VecDeque;

/// FIFO worklist of spans with "queued" and "done" marks.
///
/// A span enters the list at most once between resets, which keeps searches
/// over cyclic span graphs bounded.
#[derive(Debug, Clone)]
pub struct SpanList {
    queue: VecDeque<SpanIdx>,
    queued: Vec<bool>,
    done: Vec<bool>,
    touched: Vec<SpanIdx>,
}

impl SpanList {
    pub fn new(spans: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            queued: vec![false; spans],
            done: vec![false; spans],
            touched: Vec::new(),
        }
    }

    /// Queue `span` unless it was queued or processed since the last reset.
    pub fn push(&mut self, span: SpanIdx) -> bool {
        let i = span.index();
        if self.queued[i] || self.done[i] {
            return false;
        }
        self.queued[i] = true;
        self.touched.push(span);
        self.queue.push_back(span);
        true
    }

    pub fn pop(&mut self) -> Option<SpanIdx> {
        let span = self.queue.pop_front()?;
        self.queued[span.index()] = false;
        self.done[span.index()] = true;
        Some(span)
    }

    pub fn is_done(&self, span: SpanIdx) -> bool {
        self.done[span.index()]
    }

    /// Clear the marks of every span touched since the last reset.
    pub fn reset(&mut self) {
        self.queue.clear();
        for span in self.touched.drain(..) {
            self.queued[span.index()] = false;
            self.done[span.index()] = false;
        }
    }
}

/// Link every operand of `program` to its providers.
///
/// Returns the number of links created.
pub fn build_dependencies(program: &mut Program<'_>, graph: &mut SpanGraph) -> CompileResult<usize> {
    let mut list = SpanList::new(graph.len());
    let mut created = 0;
    let mut searches = 0;

    for i in 0..program.ops.len() {
        let idx = OpIdx(i as u32);
        let op = program.op(idx).clone();
        if op.opcode == Opcode::Nop {
            continue;
        }
        let span = op.span;
        if op.result.is_some() {
            graph.span_mut(span).changed.insert(op.result);
        }

        for (slot, var) in op.operand_slots() {
            graph.span_mut(span).used.insert(var);
            if let Some(p) = program.nearest_producer_before(var, op.order) {
                if program.op(p).span == span {
                    program.link(p, idx, slot as u8)?;
                    created += 1;
                    continue;
                }
            }

            searches += 1;
            created += link_across_spans(program, graph, &mut list, idx, slot as u8, var)?;
        }
    }

    debug!(
        "dependencies: {} links, {} cross-span searches",
        created, searches
    );
    Ok(created)
}

/// Search predecessor spans of `consumer` for producers of `var`.
fn link_across_spans(
    program: &mut Program<'_>,
    graph: &mut SpanGraph,
    list: &mut SpanList,
    consumer: OpIdx,
    slot: u8,
    var: VarId,
) -> CompileResult<usize> {
    let home = program.op(consumer).span;
    let mut found = 0;

    list.reset();
    graph.span_mut(home).used_before.insert(var);
    let preds = graph.span(home).preds.clone();
    for pred in preds {
        graph.span_mut(pred).used_after.insert(var);
        list.push(pred);
    }

    while let Some(span) = list.pop() {
        if let Some(producer) = program.last_producer_in_span(var, span) {
            trace!("{} slot {} of {} <- {} in {}", var, slot, consumer, producer, span);
            program.link(producer, consumer, slot)?;
            found += 1;
            continue;
        }
        graph.span_mut(span).used_before.insert(var);
        let preds = graph.span(span).preds.clone();
        for pred in preds {
            graph.span_mut(pred).used_after.insert(var);
            list.push(pred);
        }
    }

    if found == 0 {
        return Err(CompileError::UninitializedVariable {
            var,
            operator: consumer,
        });
    }
    Ok(found)
}
