//! Program analyses: span graph, dependency graph, SSA conversion and the
//! usage table that drives eviction.

pub mod dependency;
pub mod span_graph;
pub mod ssa;
pub mod usage;

pub use dependency::{build_dependencies, SpanList};
pub use span_graph::{build_span_graph, Span, SpanGraph};
pub use ssa::{check_ssa, convert_to_ssa};
pub use usage::UsageTable;
