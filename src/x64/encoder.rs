// This module wraps the iced-x86 CodeAssembler for the tilejit code generator. X64Encoder
// turns AsmReg references into concrete x86-64 registers and emits the handful of
// general-purpose instructions the kernel wrapper and the loop emitters need (moves,
// immediate add/sub/compare, three-operand imul, push/pop, conditional and unconditional
// jumps to labels) plus the single-precision vector instructions used by the tile bodies.
// Vector instructions are emitted at the width chosen when the encoder is created: ymm
// registers for AVX2 and zmm registers for AVX-512, with xmm views for the scalar tail
// and for broadcast sources. Every placed label is followed by a zero-byte marker so that
// several labels can share one code position. Constant data declared with `data` is
// counted separately so the caller can tell code bytes from trailing data bytes.

//! x86-64 instruction encoding using iced-x86.

use crate::core::error::CompileError;
use crate::core::register_file::{AsmReg, GP_BANK, VEC_BANK};
use iced_x86::code_asm::*;
use iced_x86::IcedError;

/// Error types for instruction encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Register not available in the requested bank or width.
    InvalidRegister(AsmReg),
    /// Immediate does not fit the instruction form.
    ImmediateOutOfRange(i64),
    /// Assembly error from iced-x86.
    AssemblyError(String),
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::InvalidRegister(reg) => {
                write!(f, "Invalid register {} in bank {}", reg.id, reg.bank)
            }
            EncodingError::ImmediateOutOfRange(imm) => {
                write!(f, "Immediate {imm} does not fit in 32 bits")
            }
            EncodingError::AssemblyError(msg) => write!(f, "Assembly error: {msg}"),
        }
    }
}

impl std::error::Error for EncodingError {}

impl From<EncodingError> for CompileError {
    fn from(err: EncodingError) -> Self {
        CompileError::Encoding {
            reason: err.to_string(),
        }
    }
}

fn asm_err(e: IcedError) -> EncodingError {
    EncodingError::AssemblyError(e.to_string())
}

/// Checked narrowing of an immediate.
pub fn imm32(value: i64) -> Result<i32, EncodingError> {
    i32::try_from(value).map_err(|_| EncodingError::ImmediateOutOfRange(value))
}

/// Hardware numbers of the general-purpose registers.
pub mod gp {
    use crate::core::register_file::AsmReg;

    pub const RAX: AsmReg = AsmReg::gp(0);
    pub const RCX: AsmReg = AsmReg::gp(1);
    pub const RDX: AsmReg = AsmReg::gp(2);
    pub const RBX: AsmReg = AsmReg::gp(3);
    pub const RSP: AsmReg = AsmReg::gp(4);
    pub const RBP: AsmReg = AsmReg::gp(5);
    pub const RSI: AsmReg = AsmReg::gp(6);
    pub const RDI: AsmReg = AsmReg::gp(7);
    pub const R8: AsmReg = AsmReg::gp(8);
    pub const R9: AsmReg = AsmReg::gp(9);
    pub const R10: AsmReg = AsmReg::gp(10);
    pub const R11: AsmReg = AsmReg::gp(11);
    pub const R12: AsmReg = AsmReg::gp(12);
    pub const R13: AsmReg = AsmReg::gp(13);
    pub const R14: AsmReg = AsmReg::gp(14);
    pub const R15: AsmReg = AsmReg::gp(15);
}

const GP64_REGS: [AsmRegister64; 16] = [
    rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
];

/// Vector registers addressable at every supported width.
pub const VECTOR_REGISTERS: usize = 16;

const XMM_REGS: [AsmRegisterXmm; VECTOR_REGISTERS] = [
    xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, xmm8, xmm9, xmm10, xmm11, xmm12, xmm13,
    xmm14, xmm15,
];

const YMM_REGS: [AsmRegisterYmm; VECTOR_REGISTERS] = [
    ymm0, ymm1, ymm2, ymm3, ymm4, ymm5, ymm6, ymm7, ymm8, ymm9, ymm10, ymm11, ymm12, ymm13,
    ymm14, ymm15,
];

const ZMM_REGS: [AsmRegisterZmm; VECTOR_REGISTERS] = [
    zmm0, zmm1, zmm2, zmm3, zmm4, zmm5, zmm6, zmm7, zmm8, zmm9, zmm10, zmm11, zmm12, zmm13,
    zmm14, zmm15,
];

/// Width of full vector instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorWidth {
    Ymm,
    Zmm,
}

impl VectorWidth {
    pub fn bytes(self) -> usize {
        match self {
            VectorWidth::Ymm => 32,
            VectorWidth::Zmm => 64,
        }
    }
}

/// Lane-wise binary vector operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VecBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

/// x86-64 instruction encoder using iced-x86.
pub struct X64Encoder {
    assembler: CodeAssembler,
    width: VectorWidth,
    /// Bytes declared through [`X64Encoder::data`].
    data_size: usize,
}

impl X64Encoder {
    pub fn new(width: VectorWidth) -> Result<Self, EncodingError> {
        let assembler = CodeAssembler::new(64).map_err(asm_err)?;
        Ok(Self {
            assembler,
            width,
            data_size: 0,
        })
    }

    pub fn width(&self) -> VectorWidth {
        self.width
    }

    fn gp64(&self, reg: AsmReg) -> Result<AsmRegister64, EncodingError> {
        if reg.bank != GP_BANK {
            return Err(EncodingError::InvalidRegister(reg));
        }
        GP64_REGS
            .get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister(reg))
    }

    fn vec_index(&self, reg: AsmReg) -> Result<usize, EncodingError> {
        if reg.bank != VEC_BANK || reg.id as usize >= VECTOR_REGISTERS {
            return Err(EncodingError::InvalidRegister(reg));
        }
        Ok(reg.id as usize)
    }

    fn xmm(&self, reg: AsmReg) -> Result<AsmRegisterXmm, EncodingError> {
        Ok(XMM_REGS[self.vec_index(reg)?])
    }

    fn ymm(&self, reg: AsmReg) -> Result<AsmRegisterYmm, EncodingError> {
        Ok(YMM_REGS[self.vec_index(reg)?])
    }

    fn zmm(&self, reg: AsmReg) -> Result<AsmRegisterZmm, EncodingError> {
        Ok(ZMM_REGS[self.vec_index(reg)?])
    }

    // ==== GENERAL-PURPOSE INSTRUCTIONS ====

    pub fn mov_reg_imm(&mut self, dst: AsmReg, imm: i64) -> Result<(), EncodingError> {
        let dst = self.gp64(dst)?;
        self.assembler.mov(dst, imm).map_err(asm_err)
    }

    /// `mov dst, qword [base + offset]`
    pub fn mov_reg_mem(&mut self, dst: AsmReg, base: AsmReg, offset: i32) -> Result<(), EncodingError> {
        let dst = self.gp64(dst)?;
        let base = self.gp64(base)?;
        self.assembler
            .mov(dst, qword_ptr(base + offset))
            .map_err(asm_err)
    }

    pub fn add_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst = self.gp64(dst)?;
        let src = self.gp64(src)?;
        self.assembler.add(dst, src).map_err(asm_err)
    }

    pub fn add_reg_imm(&mut self, dst: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let dst = self.gp64(dst)?;
        self.assembler.add(dst, imm).map_err(asm_err)
    }

    pub fn sub_reg_imm(&mut self, dst: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let dst = self.gp64(dst)?;
        self.assembler.sub(dst, imm).map_err(asm_err)
    }

    pub fn cmp_reg_imm(&mut self, reg: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let reg = self.gp64(reg)?;
        self.assembler.cmp(reg, imm).map_err(asm_err)
    }

    /// `imul dst, src, imm`
    pub fn imul_reg_reg_imm(&mut self, dst: AsmReg, src: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let dst = self.gp64(dst)?;
        let src = self.gp64(src)?;
        self.assembler.imul_3(dst, src, imm).map_err(asm_err)
    }

    pub fn push_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let reg = self.gp64(reg)?;
        self.assembler.push(reg).map_err(asm_err)
    }

    pub fn pop_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let reg = self.gp64(reg)?;
        self.assembler.pop(reg).map_err(asm_err)
    }

    pub fn ret(&mut self) -> Result<(), EncodingError> {
        self.assembler.ret().map_err(asm_err)
    }

    // ==== LABELS AND JUMPS ====

    pub fn create_label(&mut self) -> CodeLabel {
        self.assembler.create_label()
    }

    /// Place `label` at the current position.
    pub fn place_label(&mut self, label: &mut CodeLabel) -> Result<(), EncodingError> {
        self.assembler.set_label(label).map_err(asm_err)?;
        self.assembler.zero_bytes().map_err(asm_err)
    }

    pub fn jge(&mut self, label: CodeLabel) -> Result<(), EncodingError> {
        self.assembler.jge(label).map_err(asm_err)
    }

    pub fn jl(&mut self, label: CodeLabel) -> Result<(), EncodingError> {
        self.assembler.jl(label).map_err(asm_err)
    }

    pub fn jmp(&mut self, label: CodeLabel) -> Result<(), EncodingError> {
        self.assembler.jmp(label).map_err(asm_err)
    }

    // ==== VECTOR INSTRUCTIONS ====

    /// Full-width register copy.
    pub fn vmovups_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        match self.width {
            VectorWidth::Ymm => {
                let (dst, src) = (self.ymm(dst)?, self.ymm(src)?);
                self.assembler.vmovups(dst, src)
            }
            VectorWidth::Zmm => {
                let (dst, src) = (self.zmm(dst)?, self.zmm(src)?);
                self.assembler.vmovups(dst, src)
            }
        }
        .map_err(asm_err)
    }

    /// Full-width unaligned load from `[base + offset]`.
    pub fn vmovups_load(&mut self, dst: AsmReg, base: AsmReg, offset: i32) -> Result<(), EncodingError> {
        let base = self.gp64(base)?;
        match self.width {
            VectorWidth::Ymm => {
                let dst = self.ymm(dst)?;
                self.assembler.vmovups(dst, ymmword_ptr(base + offset))
            }
            VectorWidth::Zmm => {
                let dst = self.zmm(dst)?;
                self.assembler.vmovups(dst, zmmword_ptr(base + offset))
            }
        }
        .map_err(asm_err)
    }

    /// Full-width unaligned store to `[base + offset]`.
    pub fn vmovups_store(&mut self, base: AsmReg, offset: i32, src: AsmReg) -> Result<(), EncodingError> {
        let base = self.gp64(base)?;
        match self.width {
            VectorWidth::Ymm => {
                let src = self.ymm(src)?;
                self.assembler.vmovups(ymmword_ptr(base + offset), src)
            }
            VectorWidth::Zmm => {
                let src = self.zmm(src)?;
                self.assembler.vmovups(zmmword_ptr(base + offset), src)
            }
        }
        .map_err(asm_err)
    }

    /// Single-element load into lane 0.
    pub fn vmovss_load(&mut self, dst: AsmReg, base: AsmReg, offset: i32) -> Result<(), EncodingError> {
        let base = self.gp64(base)?;
        let dst = self.xmm(dst)?;
        self.assembler
            .vmovss(dst, dword_ptr(base + offset))
            .map_err(asm_err)
    }

    /// Single-element store of lane 0.
    pub fn vmovss_store(&mut self, base: AsmReg, offset: i32, src: AsmReg) -> Result<(), EncodingError> {
        let base = self.gp64(base)?;
        let src = self.xmm(src)?;
        self.assembler
            .vmovss(dword_ptr(base + offset), src)
            .map_err(asm_err)
    }

    /// Replicate the element at `[base + offset]` into every lane.
    pub fn vbroadcastss_mem(&mut self, dst: AsmReg, base: AsmReg, offset: i32) -> Result<(), EncodingError> {
        let base = self.gp64(base)?;
        match self.width {
            VectorWidth::Ymm => {
                let dst = self.ymm(dst)?;
                self.assembler.vbroadcastss(dst, dword_ptr(base + offset))
            }
            VectorWidth::Zmm => {
                let dst = self.zmm(dst)?;
                self.assembler.vbroadcastss(dst, dword_ptr(base + offset))
            }
        }
        .map_err(asm_err)
    }

    /// Replicate lane 0 of `src` into every lane of `dst`.
    pub fn vbroadcastss_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let src = self.xmm(src)?;
        match self.width {
            VectorWidth::Ymm => {
                let dst = self.ymm(dst)?;
                self.assembler.vbroadcastss(dst, src)
            }
            VectorWidth::Zmm => {
                let dst = self.zmm(dst)?;
                self.assembler.vbroadcastss(dst, src)
            }
        }
        .map_err(asm_err)
    }

    /// Replicate the element stored at `label` into every lane.
    pub fn vbroadcastss_label(&mut self, dst: AsmReg, label: CodeLabel) -> Result<(), EncodingError> {
        match self.width {
            VectorWidth::Ymm => {
                let dst = self.ymm(dst)?;
                self.assembler.vbroadcastss(dst, dword_ptr(label))
            }
            VectorWidth::Zmm => {
                let dst = self.zmm(dst)?;
                self.assembler.vbroadcastss(dst, dword_ptr(label))
            }
        }
        .map_err(asm_err)
    }

    /// `dst = lhs op rhs`, lane-wise.
    pub fn vbinop(&mut self, op: VecBinOp, dst: AsmReg, lhs: AsmReg, rhs: AsmReg) -> Result<(), EncodingError> {
        match self.width {
            VectorWidth::Ymm => {
                let (d, a, b) = (self.ymm(dst)?, self.ymm(lhs)?, self.ymm(rhs)?);
                match op {
                    VecBinOp::Add => self.assembler.vaddps(d, a, b),
                    VecBinOp::Sub => self.assembler.vsubps(d, a, b),
                    VecBinOp::Mul => self.assembler.vmulps(d, a, b),
                    VecBinOp::Div => self.assembler.vdivps(d, a, b),
                    VecBinOp::Max => self.assembler.vmaxps(d, a, b),
                    VecBinOp::Min => self.assembler.vminps(d, a, b),
                }
            }
            VectorWidth::Zmm => {
                let (d, a, b) = (self.zmm(dst)?, self.zmm(lhs)?, self.zmm(rhs)?);
                match op {
                    VecBinOp::Add => self.assembler.vaddps(d, a, b),
                    VecBinOp::Sub => self.assembler.vsubps(d, a, b),
                    VecBinOp::Mul => self.assembler.vmulps(d, a, b),
                    VecBinOp::Div => self.assembler.vdivps(d, a, b),
                    VecBinOp::Max => self.assembler.vmaxps(d, a, b),
                    VecBinOp::Min => self.assembler.vminps(d, a, b),
                }
            }
        }
        .map_err(asm_err)
    }

    /// `dst = a * b + dst`
    pub fn vfmadd231ps(&mut self, dst: AsmReg, a: AsmReg, b: AsmReg) -> Result<(), EncodingError> {
        match self.width {
            VectorWidth::Ymm => {
                let (d, a, b) = (self.ymm(dst)?, self.ymm(a)?, self.ymm(b)?);
                self.assembler.vfmadd231ps(d, a, b)
            }
            VectorWidth::Zmm => {
                let (d, a, b) = (self.zmm(dst)?, self.zmm(a)?, self.zmm(b)?);
                self.assembler.vfmadd231ps(d, a, b)
            }
        }
        .map_err(asm_err)
    }

    /// `dst = dst * b + c`
    pub fn vfmadd213ps(&mut self, dst: AsmReg, b: AsmReg, c: AsmReg) -> Result<(), EncodingError> {
        match self.width {
            VectorWidth::Ymm => {
                let (d, b, c) = (self.ymm(dst)?, self.ymm(b)?, self.ymm(c)?);
                self.assembler.vfmadd213ps(d, b, c)
            }
            VectorWidth::Zmm => {
                let (d, b, c) = (self.zmm(dst)?, self.zmm(b)?, self.zmm(c)?);
                self.assembler.vfmadd213ps(d, b, c)
            }
        }
        .map_err(asm_err)
    }

    // ==== DATA AND OUTPUT ====

    /// Declare raw constant bytes at the current position.
    pub fn data(&mut self, bytes: &[u8]) -> Result<(), EncodingError> {
        self.assembler.db(bytes).map_err(asm_err)?;
        self.data_size += bytes.len();
        Ok(())
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Resolve labels and produce the machine code, located at address 0.
    pub fn finalize(&mut self) -> Result<Vec<u8>, EncodingError> {
        self.assembler.assemble(0).map_err(asm_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions, Mnemonic, Register};

    fn decode(code: &[u8]) -> Vec<iced_x86::Instruction> {
        Decoder::with_ip(64, code, 0, DecoderOptions::NONE)
            .into_iter()
            .collect()
    }

    #[test]
    fn test_gp_instructions() {
        let mut enc = X64Encoder::new(VectorWidth::Ymm).unwrap();
        enc.mov_reg_imm(gp::R12, 5).unwrap();
        enc.sub_reg_imm(gp::R12, 1).unwrap();
        enc.cmp_reg_imm(gp::R12, 1).unwrap();
        enc.mov_reg_mem(gp::RAX, gp::RSI, 8).unwrap();
        enc.imul_reg_reg_imm(gp::R15, gp::R15, 64).unwrap();
        enc.ret().unwrap();

        let insts = decode(&enc.finalize().unwrap());
        let mnemonics: Vec<_> = insts.iter().map(|i| i.mnemonic()).collect();
        assert_eq!(
            mnemonics,
            vec![
                Mnemonic::Mov,
                Mnemonic::Sub,
                Mnemonic::Cmp,
                Mnemonic::Mov,
                Mnemonic::Imul,
                Mnemonic::Ret
            ]
        );
        assert_eq!(insts[0].op0_register(), Register::R12);
        assert_eq!(insts[3].memory_base(), Register::RSI);
        assert_eq!(insts[3].memory_displacement64(), 8);
    }

    #[test]
    fn test_vector_width_selects_registers() {
        let mut enc = X64Encoder::new(VectorWidth::Zmm).unwrap();
        enc.vbinop(VecBinOp::Add, AsmReg::vec(2), AsmReg::vec(0), AsmReg::vec(1))
            .unwrap();
        enc.vmovups_load(AsmReg::vec(3), gp::RAX, 64).unwrap();
        enc.vmovss_store(gp::RCX, 4, AsmReg::vec(3)).unwrap();

        let insts = decode(&enc.finalize().unwrap());
        assert_eq!(insts[0].mnemonic(), Mnemonic::Vaddps);
        assert_eq!(insts[0].op0_register(), Register::ZMM2);
        assert_eq!(insts[1].op0_register(), Register::ZMM3);
        assert_eq!(insts[2].mnemonic(), Mnemonic::Vmovss);
        assert_eq!(insts[2].op1_register(), Register::XMM3);
    }

    #[test]
    fn test_backward_jump_to_shared_position() {
        let mut enc = X64Encoder::new(VectorWidth::Ymm).unwrap();
        let mut first = enc.create_label();
        let mut second = enc.create_label();
        enc.place_label(&mut first).unwrap();
        enc.place_label(&mut second).unwrap();
        enc.sub_reg_imm(gp::RBX, 1).unwrap();
        enc.jge(first).unwrap();
        enc.jl(second).unwrap();

        let insts = decode(&enc.finalize().unwrap());
        assert_eq!(insts[1].near_branch_target(), 0);
        assert_eq!(insts[2].near_branch_target(), 0);
    }

    #[test]
    fn test_data_is_counted_separately() {
        let mut enc = X64Encoder::new(VectorWidth::Ymm).unwrap();
        let mut constant = enc.create_label();
        enc.vbroadcastss_label(AsmReg::vec(0), constant).unwrap();
        enc.ret().unwrap();
        enc.place_label(&mut constant).unwrap();
        enc.data(&1.5f32.to_le_bytes()).unwrap();

        let code = enc.finalize().unwrap();
        assert_eq!(enc.data_size(), 4);
        assert_eq!(&code[code.len() - 4..], &1.5f32.to_le_bytes());
    }

    #[test]
    fn test_wrong_bank_is_rejected() {
        let mut enc = X64Encoder::new(VectorWidth::Ymm).unwrap();
        assert_eq!(
            enc.add_reg_imm(AsmReg::vec(1), 4),
            Err(EncodingError::InvalidRegister(AsmReg::vec(1)))
        );
        assert!(imm32(1 << 40).is_err());
        let err: CompileError = EncodingError::ImmediateOutOfRange(7).into();
        assert!(matches!(err, CompileError::Encoding { .. }));
    }
}
