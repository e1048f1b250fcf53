//! tilejit - JIT register allocation and tile code generation for x86-64 vector kernels.
//!
//! A kernel is described as an ordered graph of memory accesses, lane-wise
//! arithmetic and counted loops. tilejit assigns vector registers with a
//! liveness-driven linear scan, lowers the graph into a full-width tile and a
//! single-lane tail tile, and emits both into one callable function.
//!
//! # Primary Usage
//!
//! ```
//! use bumpalo::Bump;
//! use tilejit::core::{CompilationSession, CompileParams, Generator, GraphBuilder, ElementwiseOp};
//! use tilejit::x64::{Isa, X64Backend};
//!
//! let mut b = GraphBuilder::new();
//! let src = b.parameter();
//! let x = b.load(src, 0);
//! let two = b.scalar(2.0);
//! let y = b.binary(ElementwiseOp::Mul, x, two);
//! let out = b.store(y);
//! b.result(out);
//! let mut graph = b.finish()?;
//!
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let generator = Generator::new(X64Backend::new(Isa::Avx2));
//! let kernel = generator.generate(&mut graph, CompileParams::new(1, 64), &session)?;
//! assert_eq!(kernel.lanes, 8);
//! # Ok::<(), tilejit::core::CompileError>(())
//! ```
//!
//! # Architecture
//!
//! - [`core`] - graph, liveness, allocation, tiles and the generator pipeline
//! - [`x64`] - iced-x86 encoding, emitters, kernel wrapper and ELF output

pub mod core;
pub mod x64;

pub use crate::core::{
    Backend, CompilationSession, CompileError, CompileParams, CompileResult, CompiledKernel,
    Generator, GeneratorConfig, Graph, GraphBuilder, SessionStats,
};
pub use crate::x64::{Isa, X64Backend};
