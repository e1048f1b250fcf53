// Kernel wrapper emission. The generated function follows the System V calling convention
// with two arguments: rdi points at the harness indexes and rsi at the CallArgs pointer
// table. Entry saves the callee-saved registers, loads every input pointer from the first
// half of CallArgs and every output pointer from the second half, and shifts each pointer
// by index * data offset for every harness dimension that has a nonzero offset. The body
// runs the vector tile while at least one full vector of inner work remains, then the
// scalar tile one element at a time. When the outer dimension is larger than one and the
// outer loop is enabled, the whole body repeats once per outer iteration and each pointer
// advances by its scheduler offset between iterations. Exit restores the saved registers
// and returns. Constant data of the vector tile and then of the scalar tile follows the
// code, so every RIP-relative constant lies past the final ret.

//! Entry/exit wrapper and scheduler loops around the two tiles.

use super::{EmitContext, X64Emitter};
use crate::core::compiler::CompiledKernel;
use crate::core::config::GeneratorConfig;
use crate::core::error::CompileResult;
use crate::core::session::CompilationSession;
use crate::core::tile::{Kernel, Tile, MAX_IO_PORTS};
use crate::x64::backend::{Isa, CALLEE_SAVED, OUTER_COUNT, WORK_AMOUNT};
use crate::x64::encoder::{gp, imm32};

const POINTER_SIZE: i32 = 8;

/// Emit `kernel` as one callable function.
pub fn emit_kernel(
    isa: Isa,
    kernel: &mut Kernel<X64Emitter>,
    config: &GeneratorConfig,
    session: &CompilationSession<'_>,
) -> CompileResult<CompiledKernel> {
    let lanes = kernel.scheduler.vector.lanes;
    let mut ctx = EmitContext::new(isa.vector_width()?, lanes, kernel.num_pointers())?;

    for &reg in &CALLEE_SAVED {
        ctx.enc.push_reg(reg)?;
    }
    load_pointers(&mut ctx, kernel)?;
    apply_data_offsets(&mut ctx, kernel)?;

    let params = kernel.params;
    let outer = config.outer_loop && params.outer_work() > 1;
    let mut outer_top = ctx.enc.create_label();
    if outer {
        ctx.enc.mov_reg_imm(OUTER_COUNT, params.outer_work())?;
        ctx.enc.place_label(&mut outer_top)?;
    }

    ctx.enc.mov_reg_imm(WORK_AMOUNT, params.inner_work())?;
    emit_tile_loop(&mut ctx, &mut kernel.scheduler.vector)?;
    emit_tile_loop(&mut ctx, &mut kernel.scheduler.scalar)?;

    if outer {
        for (port, &reg) in ctx.pointers().to_vec().iter().enumerate() {
            let step = params.scheduler_offsets[port];
            if step != 0 {
                ctx.enc.add_reg_imm(reg, imm32(step)?)?;
            }
        }
        ctx.enc.sub_reg_imm(OUTER_COUNT, 1)?;
        ctx.enc.cmp_reg_imm(OUTER_COUNT, 1)?;
        ctx.enc.jge(outer_top)?;
    }

    ctx.labels.finish()?;
    for &reg in CALLEE_SAVED.iter().rev() {
        ctx.enc.pop_reg(reg)?;
    }
    ctx.enc.ret()?;

    for tile in [&mut kernel.scheduler.vector, &mut kernel.scheduler.scalar] {
        for (emitter, _) in tile.body.iter_mut() {
            emitter.emit_data(&mut ctx)?;
        }
    }

    let code = ctx.enc.finalize()?;
    let data_size = ctx.enc.data_size();
    session.record_labels_bound(ctx.labels.bound_count());
    log::debug!(
        "{isa} kernel: {} pointers, outer loop {}, {} bytes",
        kernel.num_pointers(),
        if outer { "on" } else { "off" },
        code.len()
    );

    Ok(CompiledKernel {
        code,
        data_size,
        lanes,
        num_inputs: kernel.num_inputs,
        num_outputs: kernel.num_outputs,
        labels: ctx.labels.snapshot(),
    })
}

/// `ptr_i = src_ptrs[i]`, then `ptr_{ni+j} = dst_ptrs[j]`.
fn load_pointers(ctx: &mut EmitContext, kernel: &Kernel<X64Emitter>) -> CompileResult<()> {
    let slots = (0..kernel.num_inputs).chain((0..kernel.num_outputs).map(|j| MAX_IO_PORTS + j));
    for (port, slot) in slots.enumerate() {
        let ptr = ctx.pointer(port)?;
        ctx.enc.mov_reg_mem(ptr, gp::RSI, slot as i32 * POINTER_SIZE)?;
    }
    Ok(())
}

/// `ptr += indexes[dim] * data_offset[port][dim]` for every nonzero offset.
fn apply_data_offsets(ctx: &mut EmitContext, kernel: &Kernel<X64Emitter>) -> CompileResult<()> {
    let params = &kernel.params;
    for port in 0..kernel.num_pointers() {
        let ptr = ctx.pointer(port)?;
        for dim in 0..params.harness_dims as usize {
            let offset = params.data_offset(port, dim);
            if offset == 0 {
                continue;
            }
            ctx.enc
                .mov_reg_mem(WORK_AMOUNT, gp::RDI, dim as i32 * POINTER_SIZE)?;
            ctx.enc
                .imul_reg_reg_imm(WORK_AMOUNT, WORK_AMOUNT, imm32(offset)?)?;
            ctx.enc.add_reg_reg(ptr, WORK_AMOUNT)?;
        }
    }
    Ok(())
}

/// Run `tile` while at least `tile.lanes` elements of inner work remain.
fn emit_tile_loop(ctx: &mut EmitContext, tile: &mut Tile<X64Emitter>) -> CompileResult<()> {
    let step = imm32(tile.lanes as i64)?;
    let mut top = ctx.enc.create_label();
    let mut end = ctx.enc.create_label();

    ctx.enc.place_label(&mut top)?;
    ctx.enc.cmp_reg_imm(WORK_AMOUNT, step)?;
    ctx.enc.jl(end)?;
    for (emitter, regs) in tile.body.iter_mut() {
        emitter.emit_code(ctx, regs)?;
    }
    ctx.enc.sub_reg_imm(WORK_AMOUNT, step)?;
    ctx.enc.jmp(top)?;
    ctx.enc.place_label(&mut end)?;
    Ok(())
}
