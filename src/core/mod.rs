// This module gathers the target-independent half of tilejit. It owns the instruction graph
// and its text form, the per-compilation session and arena, the register bank model, the
// liveness analysis and linear-scan allocator, register-info propagation with the alias
// fix-up, post-increment selection, the label and counter tables used during emission, the
// tile and kernel containers, and the Generator that runs all of these in order against a
// Backend. Nothing here knows about x86-64 encodings; the x64 module plugs in through the
// Backend trait.

//! Target-independent compiler core.
//!
//! # Key Components
//!
//! ## Graph (`ir`, `parser`)
//! - Flat instruction arena with derived consumer edges
//! - Text IR reader and printer
//!
//! ## Register Allocation (`analyzer`, `linear_scan`, `reg_info`)
//! - Backward liveness over arena-allocated bitsets
//! - Linear scan over a fixed vector bank
//! - Register-info propagation and alias-chain fix-up
//!
//! ## Emission Support (`labels`, `tile`, `compiler`)
//! - Label and loop-counter tables keyed by control identity
//! - Vector and scalar tiles, kernel parameters
//! - The [`Generator`] pipeline and the [`Backend`] trait

pub mod analyzer;
pub mod compiler;
pub mod config;
pub mod error;
pub mod ir;
pub mod labels;
pub mod linear_scan;
pub mod parser;
pub mod post_increment;
pub mod reg_info;
pub mod register_file;
pub mod session;
pub mod tile;

pub use analyzer::{LiveInterval, Liveness};
pub use compiler::{Backend, CompiledKernel, Generator};
pub use config::{GeneratorConfig, DEFAULT_BANK_SIZE};
pub use error::{CompileError, CompileResult};
pub use ir::{
    ConvShape, ControlId, ElementwiseOp, Graph, GraphBuilder, InstId, Instruction, OpKind, Value,
};
pub use labels::{CounterRegisters, LabelTable, SlotState};
pub use parser::parse_graph;
pub use reg_info::RegInfo;
pub use register_file::{AsmReg, RegBitSet, RegisterBank};
pub use session::{CompilationSession, SessionStats};
pub use tile::{CallArgs, CompileParams, Kernel, KernelFn, Tile, TileScheduler};
