// This module provides the per-compilation session built on a bumpalo arena. A
// CompilationSession borrows the Bump that holds constant-pool payloads and every other
// arena slice the program needs, enforces an optional memory budget, and accumulates the
// SessionStats of one compilation. The budget covers both the arena and the index tables the
// program grows on the heap: every phase charges the bytes it is about to allocate through
// `charge`, which is where OutOfMemory originates. Nothing in the session is shared between
// programs, so two programs compiled on two threads each own their own session and arena.
// Statistics replace process-wide debug counters: the front end, the optimizer and the mapper
// all record into the session and the compiled blob carries a copy at the end.

//! Arena-based compilation session management.
//!
//! All arena-allocated objects of a program share the session lifetime and
//! are released in one go when the arena is dropped.

use crate::core::error::{CompileError, CompileResult};
use bumpalo::Bump;
use hashbrown::HashMap;
use std::cell::{Cell, RefCell};
use std::fmt;

/// Arena-based compilation session.
pub struct CompilationSession<'arena> {
    /// Arena allocator for compilation objects.
    arena: &'arena Bump,

    /// Byte budget over arena and tables, if any.
    memory_limit: Cell<Option<usize>>,

    /// Bytes charged for heap tables outside the arena.
    charged: Cell<usize>,

    /// Session statistics for debugging and optimization.
    stats: RefCell<SessionStats>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            memory_limit: Cell::new(None),
            charged: Cell::new(0),
            stats: RefCell::new(SessionStats::default()),
        }
    }

    /// Create a session that fails with `OutOfMemory` past `limit` bytes.
    pub fn with_memory_limit(arena: &'arena Bump, limit: usize) -> Self {
        let session = Self::new(arena);
        session.memory_limit.set(Some(limit));
        session
    }

    pub fn set_memory_limit(&self, limit: Option<usize>) {
        self.memory_limit.set(limit);
    }

    pub fn memory_limit(&self) -> Option<usize> {
        self.memory_limit.get()
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Bytes used so far by the arena and the charged tables.
    pub fn memory_used(&self) -> usize {
        self.charged.get() + self.arena.allocated_bytes()
    }

    /// Account for `bytes` of table growth, failing when the budget is exhausted.
    pub fn charge(&self, bytes: usize) -> CompileResult<()> {
        let used = self.memory_used().saturating_add(bytes);
        if let Some(limit) = self.memory_limit.get() {
            if used > limit {
                return Err(CompileError::OutOfMemory { requested: bytes });
            }
        }
        self.charged.set(self.charged.get() + bytes);
        Ok(())
    }

    /// Copy a byte slice into the arena, charging it against the budget.
    pub fn alloc_slice(&self, data: &[u8]) -> CompileResult<&'arena [u8]> {
        if let Some(limit) = self.memory_limit.get() {
            if self.memory_used().saturating_add(data.len()) > limit {
                return Err(CompileError::OutOfMemory {
                    requested: data.len(),
                });
            }
        }
        Ok(self.arena.alloc_slice_copy(data))
    }

    /// Update statistics in place.
    pub fn record(&self, update: impl FnOnce(&mut SessionStats)) {
        update(&mut self.stats.borrow_mut());
    }

    /// Record an emitted operator.
    pub fn record_operator(&self, name: &'static str) {
        let mut stats = self.stats.borrow_mut();
        stats.operators_emitted += 1;
        *stats.opcode_counts.entry(name).or_insert(0) += 1;
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Operators accepted from the front end.
    pub operators_emitted: usize,

    /// Peephole rewrites applied.
    pub rewrites: usize,

    /// Operators removed by dead-code elimination.
    pub operators_eliminated: usize,

    /// Spans in the final graph.
    pub spans: usize,

    /// Input and output connectors created.
    pub connectors: usize,

    /// Register to memory stores.
    pub saves: usize,

    /// Memory to register loads.
    pub loads: usize,

    /// Register to register moves.
    pub moves: usize,

    /// Register exchanges.
    pub swaps: usize,

    /// Saves attached above the operator that evicted the register.
    pub hoisted_saves: usize,

    /// Stack frame size in bytes.
    pub frame_size: u32,

    /// Count of each opcode emitted.
    pub opcode_counts: HashMap<&'static str, usize>,
}

impl SessionStats {
    /// Saves plus loads, i.e. memory traffic caused by register pressure.
    pub fn spills(&self) -> usize {
        self.saves + self.loads
    }
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Operators emitted: {}", self.operators_emitted)?;
        writeln!(f, "  Rewrites: {}", self.rewrites)?;
        writeln!(f, "  Operators eliminated: {}", self.operators_eliminated)?;
        writeln!(f, "  Spans: {}", self.spans)?;
        writeln!(f, "  Connectors: {}", self.connectors)?;
        writeln!(
            f,
            "  Shuffles: {} saves ({} hoisted), {} loads, {} moves, {} swaps",
            self.saves, self.hoisted_saves, self.loads, self.moves, self.swaps
        )?;
        writeln!(f, "  Frame size: {} bytes", self.frame_size)?;

        if !self.opcode_counts.is_empty() {
            writeln!(f, "  Opcode breakdown:")?;
            let mut sorted: Vec<_> = self.opcode_counts.iter().collect();
            sorted.sort_by_key(|(name, count)| (std::cmp::Reverse(**count), **name));

            for (name, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {}: {}", name, count)?;
            }
        }

        Ok(())
    }
}
