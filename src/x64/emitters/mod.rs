// This module defines the per-instruction emitters of the x86-64 code generator and the
// context they share while a kernel is emitted. X64Emitter is a closed enum with one
// variant per operation kind, built once per instruction when a tile is lowered and
// dispatched by match at emission time. Construction validates the graph shape each
// emitter depends on: loads must read a parameter or a split, elementwise operations must
// have the right number of inputs, a conditional jump must feed a loop head or a pair of
// labels, and a convolution kernel needs two free vector registers. EmitContext owns the
// encoder, the label table, the loop counter table and the pointer register of every
// kernel port, and is created per kernel so no state survives across compilations.

//! Per-instruction emitters and the shared emission context.

pub mod arithmetic;
pub mod control_flow;
pub mod kernel;
pub mod memory;

use super::backend::{counter_pool, MAX_POINTERS, POINTER_REGS};
use super::encoder::{VectorWidth, X64Encoder};
use crate::core::analyzer::is_pointer_producer;
use crate::core::error::{CompileError, CompileResult};
use crate::core::ir::{ElementwiseOp, Graph, InstId, OpKind};
use crate::core::labels::{CounterRegisters, LabelTable, SlotState};
use crate::core::register_file::{AsmReg, RegId};
use crate::core::tile::RegInfo;
use iced_x86::code_asm::CodeLabel;

pub use arithmetic::ConvolutionEmitter;
pub use control_flow::{AutoLoopEmitter, JumpEmitter, JumpTarget, LabelEmitter, LoopEmitter};
pub use memory::{MemoryAccess, ScalarEmitter};

/// State shared by all emitters of one kernel.
pub struct EmitContext {
    pub enc: X64Encoder,
    pub labels: LabelTable<CodeLabel>,
    pub counters: CounterRegisters,
    pointers: Vec<AsmReg>,
    /// Lanes of the full-width tile.
    lanes: usize,
}

impl EmitContext {
    pub fn new(width: VectorWidth, lanes: usize, num_pointers: usize) -> CompileResult<Self> {
        if num_pointers > MAX_POINTERS {
            return Err(CompileError::malformed(format!(
                "{num_pointers} pointers exceed the {MAX_POINTERS} pointer registers"
            )));
        }
        let pointers = POINTER_REGS[..num_pointers].to_vec();
        Ok(Self {
            enc: X64Encoder::new(width)?,
            labels: LabelTable::new(),
            counters: CounterRegisters::new(&counter_pool(num_pointers)),
            pointers,
            lanes,
        })
    }

    /// Register holding kernel port `index`.
    pub fn pointer(&self, index: usize) -> CompileResult<AsmReg> {
        self.pointers
            .get(index)
            .copied()
            .ok_or_else(|| {
                CompileError::malformed(format!("no pointer register for port {index}"))
            })
    }

    pub fn pointers(&self) -> &[AsmReg] {
        &self.pointers
    }

    pub fn lanes(&self) -> usize {
        self.lanes
    }

    /// Bytes in one full-width vector register.
    pub fn vec_bytes(&self) -> i32 {
        self.enc.width().bytes() as i32
    }

    /// Claim the counter register of loop `id`; the identity must not have
    /// been used as a label yet.
    pub fn begin_loop(&mut self, id: u32) -> CompileResult<AsmReg> {
        if self.labels.state(id) != SlotState::Unbound {
            return Err(CompileError::LabelAlreadyBound { id });
        }
        Ok(AsmReg::gp(self.counters.alloc(id)?))
    }

    /// Bind label `id` at the current position.
    pub fn bind_label(&mut self, id: u32) -> CompileResult<()> {
        let enc = &mut self.enc;
        let mut label = self.labels.bind(id, || enc.create_label())?;
        self.enc.place_label(&mut label)?;
        Ok(())
    }

    /// Copy a full vector register when source and destination differ.
    pub fn move_vector(&mut self, dst: usize, src: usize) -> CompileResult<()> {
        if dst != src {
            self.enc.vmovups_reg(vreg(dst), vreg(src))?;
        }
        Ok(())
    }
}

pub(crate) fn vreg(index: usize) -> AsmReg {
    AsmReg::vec(index as RegId)
}

/// Register `slot` of `regs`, or a malformed-graph error naming `what`.
pub(crate) fn reg_at(regs: &[usize], slot: usize, what: &str) -> CompileResult<usize> {
    regs.get(slot)
        .copied()
        .ok_or_else(|| {
            CompileError::malformed(format!("{what} has no register for slot {slot}"))
        })
}

/// Emitter for one instruction.
#[derive(Debug, Clone)]
pub enum X64Emitter {
    /// Parameter, Result and Split emit nothing.
    Nop,
    Load(MemoryAccess),
    Store(MemoryAccess),
    BroadcastLoad { post_increment: bool },
    BroadcastMove,
    Scalar(ScalarEmitter),
    Elementwise(ElementwiseOp),
    Convolution(ConvolutionEmitter),
    Loop(LoopEmitter),
    AutoLoop(AutoLoopEmitter),
    ConditionalJump(JumpEmitter),
    Label(LabelEmitter),
}

fn require_memory_source(graph: &Graph, id: InstId) -> CompileResult<()> {
    let inst = graph.inst(id);
    let source = inst
        .inputs
        .first()
        .map(|v| &graph.inst(v.producer).kind);
    match source {
        Some(OpKind::Parameter | OpKind::Split) => Ok(()),
        _ => Err(CompileError::malformed(format!(
            "{} {id} must read a parameter or a split",
            inst.kind.name()
        ))),
    }
}

impl X64Emitter {
    /// Build the emitter for instruction `id` of an annotated graph.
    /// Scratch registers are taken below `bank_size`.
    pub fn new(graph: &Graph, id: InstId, bank_size: usize) -> CompileResult<Self> {
        let inst = graph.inst(id);
        let emitter = match inst.kind {
            OpKind::Parameter | OpKind::Result | OpKind::Split => X64Emitter::Nop,
            OpKind::Load {
                offset,
                post_increment,
            } => {
                require_memory_source(graph, id)?;
                X64Emitter::Load(MemoryAccess::vector(offset, post_increment))
            }
            OpKind::ScalarLoad {
                offset,
                post_increment,
            } => {
                require_memory_source(graph, id)?;
                X64Emitter::Load(MemoryAccess::scalar(offset, post_increment))
            }
            OpKind::Store { offset } => X64Emitter::Store(MemoryAccess::vector(offset, true)),
            OpKind::ScalarStore { offset } => X64Emitter::Store(MemoryAccess::scalar(offset, true)),
            OpKind::BroadcastLoad { post_increment } => {
                require_memory_source(graph, id)?;
                X64Emitter::BroadcastLoad { post_increment }
            }
            OpKind::BroadcastMove => X64Emitter::BroadcastMove,
            OpKind::Scalar(value) => X64Emitter::Scalar(ScalarEmitter::new(value)),
            OpKind::Elementwise(op) => {
                if inst.inputs.len() != op.arity() {
                    return Err(CompileError::malformed(format!(
                        "{} {id} takes {} inputs, found {}",
                        op.name(),
                        op.arity(),
                        inst.inputs.len()
                    )));
                }
                X64Emitter::Elementwise(op)
            }
            OpKind::ConvolutionKernel(shape) => {
                X64Emitter::Convolution(ConvolutionEmitter::new(graph, id, shape, bank_size)?)
            }
            OpKind::Loop { id: loop_id, iterations } => X64Emitter::Loop(LoopEmitter {
                id: loop_id,
                iterations,
                moves_data: carries_vector(graph, id),
            }),
            OpKind::AutoLoop { id: loop_id } => {
                X64Emitter::AutoLoop(AutoLoopEmitter::new(graph, id, loop_id)?)
            }
            OpKind::ConditionalJump => X64Emitter::ConditionalJump(JumpEmitter::new(graph, id)?),
            OpKind::Label { id: label_id } => X64Emitter::Label(LabelEmitter {
                id: label_id,
                moves_data: carries_vector(graph, id),
            }),
        };
        Ok(emitter)
    }

    /// Emit the code body of one instruction.
    pub fn emit_code(&mut self, ctx: &mut EmitContext, regs: &RegInfo) -> CompileResult<()> {
        match self {
            X64Emitter::Nop => Ok(()),
            X64Emitter::Load(access) => access.emit_load(ctx, regs),
            X64Emitter::Store(access) => access.emit_store(ctx, regs),
            X64Emitter::BroadcastLoad { post_increment } => {
                memory::emit_broadcast_load(ctx, regs, *post_increment)
            }
            X64Emitter::BroadcastMove => memory::emit_broadcast_move(ctx, regs),
            X64Emitter::Scalar(scalar) => scalar.emit_code(ctx, regs),
            X64Emitter::Elementwise(op) => arithmetic::emit_elementwise(ctx, *op, regs),
            X64Emitter::Convolution(conv) => conv.emit_code(ctx, regs),
            X64Emitter::Loop(emitter) => emitter.emit_code(ctx, regs),
            X64Emitter::AutoLoop(emitter) => emitter.emit_code(ctx, regs),
            X64Emitter::ConditionalJump(emitter) => emitter.emit_code(ctx, regs),
            X64Emitter::Label(emitter) => emitter.emit_code(ctx, regs),
        }
    }

    /// Emit constant data referenced by the code body.
    pub fn emit_data(&mut self, ctx: &mut EmitContext) -> CompileResult<()> {
        match self {
            X64Emitter::Scalar(scalar) => scalar.emit_data(ctx),
            _ => Ok(()),
        }
    }
}

/// Whether input 0 of `id` is a vector value.
fn carries_vector(graph: &Graph, id: InstId) -> bool {
    graph
        .inst(id)
        .inputs
        .first()
        .is_some_and(|v| !is_pointer_producer(graph, v.producer))
}
