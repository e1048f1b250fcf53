// Lane-wise arithmetic and the direct-convolution inner product. Binary operations map one
// to one onto three-operand AVX instructions. The fused multiply-add computes a * b + c
// and picks the FMA form whose accumulator operand already holds the destination register,
// so no extra move is needed unless the destination differs from every input. The
// convolution emitter loads the biases into the accumulators, then for every input channel
// pack loads one weight vector and accumulates weight * broadcast(data) into each output
// position. It needs two scratch vector registers that no register-info record uses; they
// are picked when the emitter is built, after allocation has finished.

//! Elementwise and convolution emitters.

use super::{reg_at, vreg, EmitContext};
use crate::core::analyzer::is_pointer_producer;
use crate::core::error::{CompileError, CompileResult};
use crate::core::ir::{ConvShape, ElementwiseOp, Graph, InstId, ELEMENT_SIZE};
use crate::core::reg_info::unused_vector_registers;
use crate::core::register_file::RegId;
use crate::core::tile::RegInfo;
use crate::x64::encoder::VecBinOp;

fn binop(op: ElementwiseOp) -> Option<VecBinOp> {
    Some(match op {
        ElementwiseOp::Add => VecBinOp::Add,
        ElementwiseOp::Sub => VecBinOp::Sub,
        ElementwiseOp::Mul => VecBinOp::Mul,
        ElementwiseOp::Div => VecBinOp::Div,
        ElementwiseOp::Max => VecBinOp::Max,
        ElementwiseOp::Min => VecBinOp::Min,
        ElementwiseOp::FusedMulAdd => return None,
    })
}

pub fn emit_elementwise(
    ctx: &mut EmitContext,
    op: ElementwiseOp,
    regs: &RegInfo,
) -> CompileResult<()> {
    let dst = reg_at(&regs.outputs, 0, op.name())?;
    let a = reg_at(&regs.inputs, 0, op.name())?;
    let b = reg_at(&regs.inputs, 1, op.name())?;

    if let Some(bin) = binop(op) {
        ctx.enc.vbinop(bin, vreg(dst), vreg(a), vreg(b))?;
        return Ok(());
    }

    let c = reg_at(&regs.inputs, 2, op.name())?;
    if dst == c {
        ctx.enc.vfmadd231ps(vreg(dst), vreg(a), vreg(b))?;
    } else if dst == a {
        ctx.enc.vfmadd213ps(vreg(dst), vreg(b), vreg(c))?;
    } else if dst == b {
        ctx.enc.vfmadd213ps(vreg(dst), vreg(a), vreg(c))?;
    } else {
        ctx.enc.vmovups_reg(vreg(dst), vreg(a))?;
        ctx.enc.vfmadd213ps(vreg(dst), vreg(b), vreg(c))?;
    }
    Ok(())
}

/// Inner product of a small direct convolution.
#[derive(Debug, Clone)]
pub struct ConvolutionEmitter {
    pub shape: ConvShape,
    /// Scratch registers: weight vector, broadcast data element.
    aux: [RegId; 2],
}

impl ConvolutionEmitter {
    pub fn new(
        graph: &Graph,
        id: InstId,
        shape: ConvShape,
        bank_size: usize,
    ) -> CompileResult<Self> {
        let inst = graph.inst(id);
        if inst.inputs.len() != 3
            || !inst
                .inputs
                .iter()
                .all(|v| is_pointer_producer(graph, v.producer))
        {
            return Err(CompileError::malformed(format!(
                "conv {id} takes data, weight and bias pointers"
            )));
        }
        let found = inst.num_outputs as usize;
        if found != shape.accumulators() {
            return Err(CompileError::UnexpectedOutputArity {
                inst: id,
                expected: shape.accumulators(),
                found,
            });
        }

        match unused_vector_registers(graph, bank_size)[..] {
            [weight, data, ..] => Ok(Self {
                shape,
                aux: [weight, data],
            }),
            _ => Err(CompileError::FreeRegisterPoolExhausted { pool: bank_size }),
        }
    }

    pub fn aux_registers(&self) -> [RegId; 2] {
        self.aux
    }

    pub fn emit_code(&self, ctx: &mut EmitContext, regs: &RegInfo) -> CompileResult<()> {
        let data = ctx.pointer(reg_at(&regs.inputs, 0, "conv")?)?;
        let weights = ctx.pointer(reg_at(&regs.inputs, 1, "conv")?)?;
        let biases = ctx.pointer(reg_at(&regs.inputs, 2, "conv")?)?;
        let vec_bytes = ctx.vec_bytes();
        let [aux_w, aux_d] = self.aux.map(|r| vreg(r as usize));

        for (i, &acc) in regs.outputs.iter().enumerate() {
            ctx.enc
                .vmovups_load(vreg(acc), biases, i as i32 * vec_bytes)?;
        }

        let shape = self.shape;
        for pack in 0..shape.channel_packs as i32 {
            ctx.enc.vmovups_load(aux_w, weights, pack * vec_bytes)?;
            for h in 0..shape.kernel_h {
                for w in 0..shape.kernel_w {
                    let offset = h as i32 * shape.row_stride + w as i32 * shape.col_stride;
                    ctx.enc.vbroadcastss_mem(aux_d, data, offset)?;
                    let acc = reg_at(&regs.outputs, (h * shape.kernel_w + w) as usize, "conv")?;
                    ctx.enc.vfmadd231ps(vreg(acc), aux_w, aux_d)?;
                }
            }
        }
        log::trace!(
            "conv {}x{} over {} packs, element stride {}",
            shape.kernel_h,
            shape.kernel_w,
            shape.channel_packs,
            ELEMENT_SIZE
        );
        Ok(())
    }
}
