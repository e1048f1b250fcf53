//! Memory access and value-moving emitters.
//!
//! Loads and stores address `[pointer + offset]` and then optionally advance
//! the pointer by the bytes one tile iteration consumes: a full vector in the
//! vector tile, one element in the scalar tile.

use super::{reg_at, vreg, EmitContext};
use crate::core::error::CompileResult;
use crate::core::ir::ELEMENT_SIZE;
use crate::core::tile::RegInfo;
use iced_x86::code_asm::CodeLabel;

/// Vector or single-element load/store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAccess {
    pub offset: i32,
    pub post_increment: bool,
    /// Single-element access of the tail tile.
    pub scalar: bool,
}

impl MemoryAccess {
    pub fn vector(offset: i32, post_increment: bool) -> Self {
        Self {
            offset,
            post_increment,
            scalar: false,
        }
    }

    pub fn scalar(offset: i32, post_increment: bool) -> Self {
        Self {
            offset,
            post_increment,
            scalar: true,
        }
    }

    fn step(&self, ctx: &EmitContext) -> i32 {
        if self.scalar {
            ELEMENT_SIZE as i32
        } else {
            (ctx.lanes() * ELEMENT_SIZE) as i32
        }
    }

    /// `vec <- [ptr + offset]`
    pub fn emit_load(&self, ctx: &mut EmitContext, regs: &RegInfo) -> CompileResult<()> {
        let ptr = ctx.pointer(reg_at(&regs.inputs, 0, "load")?)?;
        let dst = vreg(reg_at(&regs.outputs, 0, "load")?);
        if self.scalar {
            ctx.enc.vmovss_load(dst, ptr, self.offset)?;
        } else {
            ctx.enc.vmovups_load(dst, ptr, self.offset)?;
        }
        if self.post_increment {
            let step = self.step(ctx);
            ctx.enc.add_reg_imm(ptr, step)?;
        }
        Ok(())
    }

    /// `[ptr + offset] <- vec`; the pointer is the one of the Result fed.
    pub fn emit_store(&self, ctx: &mut EmitContext, regs: &RegInfo) -> CompileResult<()> {
        let src = vreg(reg_at(&regs.inputs, 0, "store")?);
        let ptr = ctx.pointer(reg_at(&regs.outputs, 0, "store")?)?;
        if self.scalar {
            ctx.enc.vmovss_store(ptr, self.offset, src)?;
        } else {
            ctx.enc.vmovups_store(ptr, self.offset, src)?;
        }
        if self.post_increment {
            let step = self.step(ctx);
            ctx.enc.add_reg_imm(ptr, step)?;
        }
        Ok(())
    }
}

/// Replicate `[ptr]` into every lane, advancing the pointer by one element.
pub fn emit_broadcast_load(
    ctx: &mut EmitContext,
    regs: &RegInfo,
    post_increment: bool,
) -> CompileResult<()> {
    let ptr = ctx.pointer(reg_at(&regs.inputs, 0, "broadcast_load")?)?;
    let dst = vreg(reg_at(&regs.outputs, 0, "broadcast_load")?);
    ctx.enc.vbroadcastss_mem(dst, ptr, 0)?;
    if post_increment {
        ctx.enc.add_reg_imm(ptr, ELEMENT_SIZE as i32)?;
    }
    Ok(())
}

pub fn emit_broadcast_move(ctx: &mut EmitContext, regs: &RegInfo) -> CompileResult<()> {
    let src = vreg(reg_at(&regs.inputs, 0, "broadcast_move")?);
    let dst = vreg(reg_at(&regs.outputs, 0, "broadcast_move")?);
    ctx.enc.vbroadcastss_reg(dst, src)?;
    Ok(())
}

/// Constant materialised from a RIP-relative data slot placed after the code.
#[derive(Debug, Clone)]
pub struct ScalarEmitter {
    pub value: f32,
    label: Option<CodeLabel>,
}

impl ScalarEmitter {
    pub fn new(value: f32) -> Self {
        Self { value, label: None }
    }

    pub fn emit_code(&mut self, ctx: &mut EmitContext, regs: &RegInfo) -> CompileResult<()> {
        let dst = vreg(reg_at(&regs.outputs, 0, "scalar")?);
        let label = ctx.enc.create_label();
        ctx.enc.vbroadcastss_label(dst, label)?;
        self.label = Some(label);
        Ok(())
    }

    pub fn emit_data(&mut self, ctx: &mut EmitContext) -> CompileResult<()> {
        if let Some(mut label) = self.label.take() {
            ctx.enc.place_label(&mut label)?;
            ctx.enc.data(&self.value.to_le_bytes())?;
        }
        Ok(())
    }
}
