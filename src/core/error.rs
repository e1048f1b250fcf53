// This module defines the error taxonomy of the tilejit compiler using the thiserror crate.
// CompileError covers every way a compilation can fail: exhausting the vector register
// bank during linear scan or the free pool during alias fix-up, configuring a bank the
// target cannot address, looking up register info, labels or counter registers that
// were never written, binding an identity twice, requesting an instruction set the code
// generator cannot target, and feeding a graph whose shape does not match what the
// emitters expect. Each variant carries the instruction, identity or position involved.
// CompileResult<T> is the convenience alias used across all passes. Every error is
// fatal: passes propagate them with `?` and the compilation is abandoned without
// partial results.

//! Error types for the tilejit compiler.
//!
//! Using thiserror for idiomatic error handling.

use thiserror::Error;

/// Main error type for kernel compilation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("cannot allocate registers: {active} intervals live at position {position} exceed bank of {capacity}")]
    RegisterBankExhausted {
        position: usize,
        active: usize,
        capacity: usize,
    },

    #[error("bank of {requested} vector registers is unsupported, the target has {available}")]
    UnsupportedBankSize { requested: usize, available: usize },

    #[error("free register pool exhausted ({pool} registers)")]
    FreeRegisterPoolExhausted { pool: usize },

    #[error("register info is absent for instruction {inst}")]
    MissingRegInfo { inst: usize },

    #[error("label with id {id} already exists")]
    LabelAlreadyBound { id: u32 },

    #[error("label with id {id} was not found")]
    LabelNotBound { id: u32 },

    #[error("label with id {id} was already consumed")]
    LabelAlreadyConsumed { id: u32 },

    #[error("counter register for id {id} already allocated")]
    RegisterAlreadyBound { id: u32 },

    #[error("counter register for id {id} was not found")]
    RegisterNotBound { id: u32 },

    #[error("instruction {inst} has {found} outputs, expected {expected}")]
    UnexpectedOutputArity {
        inst: usize,
        expected: usize,
        found: usize,
    },

    #[error("unsupported architecture for code generation: {isa}")]
    UnsupportedIsa { isa: String },

    #[error("malformed graph: {reason}")]
    MalformedGraph { reason: String },

    #[error("parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("encoding failed: {reason}")]
    Encoding { reason: String },

    #[error("object file emission failed: {reason}")]
    Object { reason: String },
}

impl CompileError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        CompileError::MalformedGraph {
            reason: reason.into(),
        }
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_failure() {
        let err = CompileError::RegisterBankExhausted {
            position: 16,
            active: 16,
            capacity: 16,
        };
        assert!(err.to_string().contains("cannot allocate registers"));

        let err = CompileError::LabelAlreadyBound { id: 3 };
        assert_eq!(err.to_string(), "label with id 3 already exists");
    }
}
