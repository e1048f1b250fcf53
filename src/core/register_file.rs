//! Register identities, register sets and free-register pools.
//!
//! Linear scan hands vector registers out of a [`RegisterBank`], a LIFO stack
//! of free register ids. The same stack type backs the pool of general-purpose
//! loop counter registers used during emission.

use super::error::{CompileError, CompileResult};

/// Maximum number of register banks supported (GP, vector).
pub const MAX_REGISTER_BANKS: usize = 2;

/// Type for register bank indices.
pub type RegBank = u8;

/// Type for register IDs within a bank.
pub type RegId = u8;

/// General-purpose (pointer and counter) registers.
pub const GP_BANK: RegBank = 0;

/// SIMD registers.
pub const VEC_BANK: RegBank = 1;

/// Combined register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsmReg {
    pub bank: RegBank,
    pub id: RegId,
}

impl AsmReg {
    pub const fn new(bank: RegBank, id: RegId) -> Self {
        Self { bank, id }
    }

    pub const fn gp(id: RegId) -> Self {
        Self::new(GP_BANK, id)
    }

    pub const fn vec(id: RegId) -> Self {
        Self::new(VEC_BANK, id)
    }
}

/// Registers one bank of a [`RegBitSet`] can track.
pub const MAX_BANK_REGISTERS: usize = 64;

/// Bit set for efficiently tracking register sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegBitSet {
    /// Bit mask for each register bank.
    banks: [u64; MAX_REGISTER_BANKS],
}

impl RegBitSet {
    /// Create empty register set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if register is set.
    pub fn contains(&self, reg: AsmReg) -> bool {
        if reg.bank as usize >= MAX_REGISTER_BANKS || reg.id as usize >= MAX_BANK_REGISTERS {
            return false;
        }
        (self.banks[reg.bank as usize] & (1u64 << reg.id)) != 0
    }

    /// Set a register.
    pub fn set(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS && (reg.id as usize) < MAX_BANK_REGISTERS {
            self.banks[reg.bank as usize] |= 1u64 << reg.id;
        }
    }

    /// Clear a register.
    pub fn clear(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS && (reg.id as usize) < MAX_BANK_REGISTERS {
            self.banks[reg.bank as usize] &= !(1u64 << reg.id);
        }
    }

    /// Lowest register id of `bank` below `limit` that is not in the set.
    pub fn first_clear_in_bank(&self, bank: RegBank, limit: usize) -> Option<RegId> {
        let mask = self.banks.get(bank as usize).copied().unwrap_or(0);
        (0..limit.min(MAX_BANK_REGISTERS))
            .find(|&id| mask & (1u64 << id) == 0)
            .map(|id| id as RegId)
    }

    /// All register ids of `bank` below `limit` that are not in the set.
    pub fn clear_in_bank(&self, bank: RegBank, limit: usize) -> Vec<RegId> {
        let mask = self.banks.get(bank as usize).copied().unwrap_or(0);
        (0..limit.min(MAX_BANK_REGISTERS))
            .filter(|&id| mask & (1u64 << id) == 0)
            .map(|id| id as RegId)
            .collect()
    }

    /// Count number of set registers in bank.
    pub fn count_in_bank(&self, bank: RegBank) -> u32 {
        if bank as usize >= MAX_REGISTER_BANKS {
            return 0;
        }
        self.banks[bank as usize].count_ones()
    }
}

/// LIFO pool of free registers.
///
/// A fresh bank hands out its registers in ascending order; a register
/// returned with [`RegisterBank::release`] is the next one handed out.
#[derive(Debug, Clone)]
pub struct RegisterBank {
    capacity: usize,
    free: Vec<RegId>,
}

impl RegisterBank {
    /// Bank of registers `0..capacity`.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: (0..capacity).rev().map(|id| id as RegId).collect(),
        }
    }

    /// Bank over an explicit register list, handed out front to back.
    pub fn from_registers(registers: &[RegId]) -> Self {
        Self {
            capacity: registers.len(),
            free: registers.iter().rev().copied().collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Take the register on top of the free stack.
    pub fn acquire(&mut self) -> CompileResult<RegId> {
        self.free
            .pop()
            .ok_or(CompileError::FreeRegisterPoolExhausted {
                pool: self.capacity,
            })
    }

    /// Return a register to the top of the free stack.
    pub fn release(&mut self, reg: RegId) {
        debug_assert!(!self.free.contains(&reg), "register {reg} released twice");
        self.free.push(reg);
    }
}
