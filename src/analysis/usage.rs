//! Usage table for eviction decisions.

use super::span_graph::SpanGraph;
use crate::ir::{Opcode, Program, SpanIdx, VarId};
use std::collections::VecDeque;

/// Sorted program orders of every read, per variable.
#[derive(Debug, Clone, Default)]
pub struct UsageTable {
    reads: Vec<Vec<u32>>,
}

impl UsageTable {
    pub fn build(program: &Program<'_>) -> Self {
        let mut reads = vec![Vec::new(); program.var_count()];
        for op in program.operators() {
            if op.opcode == Opcode::Nop {
                continue;
            }
            for (_, var) in op.operand_slots() {
                let list: &mut Vec<u32> = &mut reads[var.index()];
                if list.last() != Some(&op.order) {
                    list.push(op.order);
                }
            }
        }
        Self { reads }
    }

    pub fn reads(&self, var: VarId) -> &[u32] {
        self.reads.get(var.index()).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First read of `var` in `from..=last`.
    pub fn next_read(&self, var: VarId, from: u32, last: u32) -> Option<u32> {
        let reads = self.reads(var);
        let pos = reads.partition_point(|&order| order < from);
        reads.get(pos).copied().filter(|&order| order <= last)
    }

    /// Operators between `from` and the next read of `var`.
    ///
    /// Looks in the rest of the span first, then breadth-first through
    /// successor spans that the value flows into. The first consumer found in
    /// breadth-first order wins, which is not necessarily the nearest one on
    /// every path. `None` means no further consumer is reachable.
    pub fn distance_to_consumer(
        &self,
        var: VarId,
        from: u32,
        span: SpanIdx,
        graph: &SpanGraph,
    ) -> Option<u32> {
        let home = graph.span(span);
        if let Some(read) = self.next_read(var, from, home.last) {
            return Some(read - from);
        }
        if !home.used_after.contains(var) {
            return None;
        }

        let mut visited = vec![false; graph.len()];
        let mut queue = VecDeque::new();
        let acc = home.last.saturating_sub(from) + 1;
        for succ in &home.succs {
            queue.push_back((*succ, acc));
        }

        while let Some((idx, acc)) = queue.pop_front() {
            if std::mem::replace(&mut visited[idx.index()], true) {
                continue;
            }
            let span = graph.span(idx);
            if !span.used_before.contains(var) {
                continue;
            }
            if let Some(read) = self.next_read(var, span.first, span.last) {
                return Some(acc + read - span.first);
            }
            if span.used_after.contains(var) {
                for succ in &span.succs {
                    queue.push_back((*succ, acc + span.len()));
                }
            }
        }
        None
    }
}
