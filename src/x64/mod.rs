//! x86-64 code generation.
//!
//! - [`encoder`]: iced-x86 instruction encoding
//! - [`backend`]: instruction-set selection and the [`Backend`](crate::core::Backend) implementation
//! - [`emitters`]: per-instruction emitters and the kernel wrapper
//! - [`object_file`]: ELF output

pub mod backend;
pub mod emitters;
pub mod encoder;
pub mod object_file;

pub use backend::{Isa, X64Backend};
pub use emitters::{EmitContext, X64Emitter};
pub use encoder::{EncodingError, VectorWidth, X64Encoder};
pub use object_file::emit_elf;
