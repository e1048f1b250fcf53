// This module provides arena-based compilation session management using the bumpalo crate.
// CompilationSession owns a reference to the arena for one kernel compilation and collects
// statistics as the passes run: how many instructions were lowered into tiles (broken down
// by op name), how many live intervals were allocated and how many distinct vector
// registers they occupied, how many alias chains were rewritten, how many labels were
// bound during emission, and the final code and constant-data sizes. The liveness pass
// allocates its per-instruction sets in the session arena so they are released together
// when the compilation ends. A session is never shared between compilations.

//! Arena-based compilation session management.
//!
//! All per-compilation scratch data is allocated in the session arena and
//! shares its lifetime.

use bumpalo::Bump;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::fmt;

/// Arena-based compilation session.
pub struct CompilationSession<'arena> {
    /// Arena allocator for compilation objects.
    arena: &'arena Bump,

    /// Session statistics for debugging.
    stats: RefCell<SessionStats>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
        }
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Allocate a slice in the session arena.
    pub fn alloc_slice<T>(&self, slice: &[T]) -> &'arena [T]
    where
        T: Clone,
    {
        self.arena.alloc_slice_clone(slice)
    }

    /// Record one instruction placed into a tile.
    pub fn record_instruction_lowered(&self, op: &'static str) {
        let mut stats = self.stats.borrow_mut();
        stats.instructions_lowered += 1;
        *stats.instruction_counts.entry(op).or_insert(0) += 1;
    }

    /// Record the outcome of linear scan.
    pub fn record_allocation(&self, intervals: usize, registers_used: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.intervals_allocated += intervals;
        stats.registers_used = stats.registers_used.max(registers_used);
    }

    /// Record one alias chain moved to a fresh register.
    pub fn record_alias_fixup(&self) {
        self.stats.borrow_mut().alias_fixups += 1;
    }

    pub fn record_labels_bound(&self, count: usize) {
        self.stats.borrow_mut().labels_bound += count;
    }

    /// Record a finished kernel.
    pub fn record_kernel_compiled(&self, code_size: usize, data_size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.kernels_compiled += 1;
        stats.code_size += code_size;
        stats.data_size += data_size;
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub kernels_compiled: usize,

    /// Instructions placed into tiles, vector and scalar together.
    pub instructions_lowered: usize,

    /// Count of each op kind lowered.
    pub instruction_counts: HashMap<&'static str, usize>,

    pub intervals_allocated: usize,

    /// Distinct vector registers handed out by linear scan.
    pub registers_used: usize,

    pub alias_fixups: usize,

    pub labels_bound: usize,

    /// Machine code bytes, constant data included.
    pub code_size: usize,

    /// Constant data bytes emitted after the code.
    pub data_size: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Kernels compiled: {}", self.kernels_compiled)?;
        writeln!(f, "  Instructions lowered: {}", self.instructions_lowered)?;
        writeln!(f, "  Live intervals: {}", self.intervals_allocated)?;
        writeln!(f, "  Vector registers used: {}", self.registers_used)?;
        writeln!(f, "  Alias fix-ups: {}", self.alias_fixups)?;
        writeln!(f, "  Labels bound: {}", self.labels_bound)?;
        writeln!(f, "  Code size: {} bytes", self.code_size)?;
        writeln!(f, "  Constant data: {} bytes", self.data_size)?;

        if !self.instruction_counts.is_empty() {
            writeln!(f, "  Instruction breakdown:")?;
            let mut sorted: Vec<_> = self.instruction_counts.iter().collect();
            sorted.sort_by(|(a, x), (b, y)| y.cmp(x).then(a.cmp(b)));

            for (op, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {}: {}", op, count)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compilation_session_creation() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let stats = session.stats();
        assert_eq!(stats.kernels_compiled, 0);
        assert_eq!(stats.instructions_lowered, 0);
        assert_eq!(stats.alias_fixups, 0);
    }

    #[test]
    fn test_arena_allocation() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let slice = session.alloc_slice(&[1, 2, 3, 4]);
        assert_eq!(slice, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_session_statistics() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        session.record_instruction_lowered("load");
        session.record_instruction_lowered("add");
        session.record_instruction_lowered("load");
        session.record_allocation(5, 3);
        session.record_allocation(2, 2);
        session.record_alias_fixup();
        session.record_labels_bound(4);
        session.record_kernel_compiled(120, 8);

        let stats = session.stats();
        assert_eq!(stats.instructions_lowered, 3);
        assert_eq!(stats.instruction_counts["load"], 2);
        assert_eq!(stats.intervals_allocated, 7);
        assert_eq!(stats.registers_used, 3);
        assert_eq!(stats.alias_fixups, 1);
        assert_eq!(stats.labels_bound, 4);
        assert_eq!(stats.code_size, 120);
        assert_eq!(stats.data_size, 8);
    }

    #[test]
    fn test_statistics_display() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        session.record_instruction_lowered("store");
        session.record_kernel_compiled(64, 0);

        let output = format!("{}", session.stats());
        assert!(output.contains("Kernels compiled: 1"));
        assert!(output.contains("Code size: 64 bytes"));
        assert!(output.contains("store: 1"));
    }
}
