//! Linear-scan register allocation over live intervals.
//!
//! Intervals are visited in start order (ties broken by end, then by logical
//! index). Before each allocation every active interval whose end precedes the
//! new start is retired and its register pushed back onto the free stack. An
//! interval ending exactly where the next one starts is still live there. With
//! no spill path, a full bank at allocation time aborts the compilation.

use super::analyzer::LiveInterval;
use super::error::{CompileError, CompileResult};
use super::register_file::{RegId, RegisterBank, MAX_BANK_REGISTERS};

/// Physical register per logical value index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    registers: Vec<Option<RegId>>,
    registers_used: usize,
}

impl Allocation {
    pub fn register(&self, index: usize) -> Option<RegId> {
        self.registers.get(index).copied().flatten()
    }

    /// Number of distinct registers handed out.
    pub fn registers_used(&self) -> usize {
        self.registers_used
    }
}

/// Allocate every interval into a bank of `capacity` registers.
pub fn allocate(intervals: &[LiveInterval], capacity: usize) -> CompileResult<Allocation> {
    if capacity > MAX_BANK_REGISTERS {
        return Err(CompileError::UnsupportedBankSize {
            requested: capacity,
            available: MAX_BANK_REGISTERS,
        });
    }

    let mut sorted: Vec<&LiveInterval> = intervals.iter().collect();
    sorted.sort_by_key(|i| (i.start, i.end, i.index));

    let slots = intervals.iter().map(|i| i.index + 1).max().unwrap_or(0);
    let mut registers = vec![None; slots];
    let mut bank = RegisterBank::new(capacity);
    // kept sorted by (end, start, index)
    let mut active: Vec<(&LiveInterval, RegId)> = Vec::new();
    let mut high_water = 0;

    for interval in sorted {
        while let Some(&(oldest, reg)) = active.first() {
            if oldest.end >= interval.start {
                break;
            }
            active.remove(0);
            bank.release(reg);
            log::trace!("expire v{} -> r{}", oldest.index, reg);
        }

        if active.len() == capacity {
            return Err(CompileError::RegisterBankExhausted {
                position: interval.start,
                active: active.len() + 1,
                capacity,
            });
        }

        let reg = bank.acquire()?;
        log::trace!(
            "allocate v{} [{}, {}] -> r{}",
            interval.index,
            interval.start,
            interval.end,
            reg
        );
        registers[interval.index] = Some(reg);
        high_water = high_water.max(reg as usize + 1);

        let key = (interval.end, interval.start, interval.index);
        let at = active.partition_point(|(a, _)| (a.end, a.start, a.index) < key);
        active.insert(at, (interval, reg));
    }

    log::debug!(
        "linear scan: {} intervals in {} of {} registers",
        intervals.len(),
        high_water,
        capacity
    );

    Ok(Allocation {
        registers,
        registers_used: high_water,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ir::Value;

    fn interval(index: usize, start: usize, end: usize) -> LiveInterval {
        LiveInterval {
            index,
            value: Value::new(index, 0),
            start,
            end,
        }
    }

    #[test]
    fn test_registers_are_reused_after_expiry() {
        let intervals = [interval(0, 0, 1), interval(1, 1, 2), interval(2, 2, 3)];
        let alloc = allocate(&intervals, 16).unwrap();
        assert_eq!(alloc.register(0), Some(0));
        assert_eq!(alloc.register(1), Some(1));
        // v0 ended at 1 < 2, so r0 is back on top of the stack
        assert_eq!(alloc.register(2), Some(0));
        assert_eq!(alloc.registers_used(), 2);
    }

    #[test]
    fn test_touching_intervals_overlap() {
        let intervals = [interval(0, 0, 2), interval(1, 2, 3)];
        let alloc = allocate(&intervals, 2).unwrap();
        assert_ne!(alloc.register(0), alloc.register(1));
    }

    #[test]
    fn test_full_bank_fails() {
        let intervals: Vec<_> = (0..3).map(|i| interval(i, i, 5)).collect();
        let err = allocate(&intervals, 2).unwrap_err();
        assert_eq!(
            err,
            CompileError::RegisterBankExhausted {
                position: 2,
                active: 3,
                capacity: 2
            }
        );
    }

    #[test]
    fn test_exactly_capacity_succeeds() {
        let intervals: Vec<_> = (0..4).map(|i| interval(i, i, 8)).collect();
        let alloc = allocate(&intervals, 4).unwrap();
        let mut regs: Vec<_> = (0..4).map(|i| alloc.register(i).unwrap()).collect();
        regs.sort();
        assert_eq!(regs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_bank_wider_than_a_register_set_is_rejected() {
        let intervals = [interval(0, 0, 1)];
        assert_eq!(
            allocate(&intervals, 300).unwrap_err(),
            CompileError::UnsupportedBankSize {
                requested: 300,
                available: MAX_BANK_REGISTERS
            }
        );
        let alloc = allocate(&intervals, MAX_BANK_REGISTERS).unwrap();
        assert_eq!(alloc.register(0), Some(0));
    }
}
