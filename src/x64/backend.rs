//! x86-64 backend.
//!
//! Bridges the [`Generator`](crate::core::Generator) pipeline with the iced-x86
//! encoder: selects the vector width for the requested instruction set, builds
//! one [`X64Emitter`] per instruction and emits finished kernels.

use super::emitters::{self, X64Emitter};
use super::encoder::{gp, VectorWidth, VECTOR_REGISTERS};
use crate::core::compiler::{Backend, CompiledKernel};
use crate::core::config::GeneratorConfig;
use crate::core::error::{CompileError, CompileResult};
use crate::core::ir::Graph;
use crate::core::register_file::{AsmReg, RegId};
use crate::core::session::CompilationSession;
use crate::core::tile::Kernel;
use std::fmt;
use std::str::FromStr;

/// General-purpose registers handed out to pointers, in order. Whatever the
/// pointers leave over becomes the loop counter pool.
pub const POINTER_REGS: [AsmReg; 13] = [
    gp::RAX,
    gp::RCX,
    gp::RDX,
    gp::RBX,
    gp::RBP,
    gp::R8,
    gp::R9,
    gp::R10,
    gp::R11,
    gp::R12,
    gp::R13,
    gp::RSI,
    gp::RDI,
];

/// Pointers must leave `rsi` and `rdi` alone until the entry code has read them.
pub const MAX_POINTERS: usize = 11;

/// Remaining inner work amount; also scratch during entry.
pub const WORK_AMOUNT: AsmReg = gp::R15;

/// Remaining outer iterations.
pub const OUTER_COUNT: AsmReg = gp::R14;

/// Registers saved on entry and restored on exit.
pub const CALLEE_SAVED: [AsmReg; 6] = [gp::RBX, gp::RBP, gp::R12, gp::R13, gp::R14, gp::R15];

/// Vector instruction set to target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Isa {
    Sse41,
    Avx2,
    Avx512,
}

impl Isa {
    /// Best instruction set the host CPU supports.
    pub fn detect_host() -> Isa {
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("avx512f") {
                return Isa::Avx512;
            }
            if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
                return Isa::Avx2;
            }
        }
        Isa::Sse41
    }

    pub fn is_supported(self) -> bool {
        !matches!(self, Isa::Sse41)
    }

    /// f32 lanes per full-width register.
    pub fn lanes(self) -> usize {
        match self {
            Isa::Sse41 => 4,
            Isa::Avx2 => 8,
            Isa::Avx512 => 16,
        }
    }

    pub fn vector_width(self) -> CompileResult<VectorWidth> {
        match self {
            Isa::Avx2 => Ok(VectorWidth::Ymm),
            Isa::Avx512 => Ok(VectorWidth::Zmm),
            Isa::Sse41 => Err(CompileError::UnsupportedIsa {
                isa: self.to_string(),
            }),
        }
    }
}

impl fmt::Display for Isa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Isa::Sse41 => "sse41",
            Isa::Avx2 => "avx2",
            Isa::Avx512 => "avx512",
        })
    }
}

impl FromStr for Isa {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sse41" | "sse4.1" => Ok(Isa::Sse41),
            "avx2" => Ok(Isa::Avx2),
            "avx512" | "avx512f" => Ok(Isa::Avx512),
            "host" => Ok(Isa::detect_host()),
            _ => Err(CompileError::UnsupportedIsa { isa: s.to_string() }),
        }
    }
}

/// Loop counter registers left after `num_pointers` pointer registers.
pub fn counter_pool(num_pointers: usize) -> Vec<RegId> {
    POINTER_REGS
        .iter()
        .skip(num_pointers)
        .map(|reg| reg.id)
        .collect()
}

/// x86-64 backend implementing the [`Backend`] trait.
#[derive(Debug, Clone, Copy)]
pub struct X64Backend {
    isa: Isa,
}

impl X64Backend {
    pub fn new(isa: Isa) -> Self {
        Self { isa }
    }

    pub fn host() -> Self {
        Self::new(Isa::detect_host())
    }

    pub fn isa(&self) -> Isa {
        self.isa
    }
}

impl Backend for X64Backend {
    type Emitter = X64Emitter;

    fn name(&self) -> String {
        self.isa.to_string()
    }

    fn is_supported(&self) -> bool {
        self.isa.is_supported()
    }

    fn lanes(&self) -> usize {
        self.isa.lanes()
    }

    fn vector_registers(&self) -> usize {
        VECTOR_REGISTERS
    }

    fn create_emitter(
        &self,
        graph: &Graph,
        id: usize,
        bank_size: usize,
    ) -> CompileResult<X64Emitter> {
        X64Emitter::new(graph, id, bank_size)
    }

    fn emit_kernel(
        &self,
        kernel: &mut Kernel<X64Emitter>,
        config: &GeneratorConfig,
        session: &CompilationSession<'_>,
    ) -> CompileResult<CompiledKernel> {
        emitters::kernel::emit_kernel(self.isa, kernel, config, session)
    }
}
