// Loop heads, labels and conditional jumps. A loop head allocates a counter register for
// its identity, loads the iteration count and binds the identity's label at the top of the
// body. The auto loop spills its data inputs to the stack first and pops one per
// iteration. A conditional jump is classified when its emitter is built: when its jump
// edge feeds a loop head it is that loop's back-edge, and when both of its edges feed
// labels it is a two-way branch on the counter of the enclosing loop. Anything else is a
// malformed graph. Labels and counters are looked up by identity through the tables in
// EmitContext, so the emitters themselves hold no native handles.

//! Control-flow emitters.

use super::{reg_at, EmitContext};
use crate::core::analyzer::is_pointer_producer;
use crate::core::error::{CompileError, CompileResult};
use crate::core::ir::{ControlId, Graph, InstId, OpKind, Value};
use crate::core::register_file::AsmReg;
use crate::core::tile::RegInfo;
use crate::x64::encoder::gp;

/// Counted loop head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopEmitter {
    pub id: ControlId,
    pub iterations: u32,
    /// Input 0 is a vector value to forward to output 0.
    pub moves_data: bool,
}

impl LoopEmitter {
    pub fn emit_code(&self, ctx: &mut EmitContext, regs: &RegInfo) -> CompileResult<()> {
        if self.moves_data {
            ctx.move_vector(reg_at(&regs.outputs, 0, "loop")?, reg_at(&regs.inputs, 0, "loop")?)?;
        }
        let counter = ctx.begin_loop(self.id)?;
        ctx.enc.mov_reg_imm(counter, i64::from(self.iterations))?;
        ctx.bind_label(self.id)
    }
}

/// Loop head that iterates once per data input, popping one input per iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoLoopEmitter {
    pub id: ControlId,
    /// Data inputs; the last input is the back-edge.
    pub iterations: usize,
}

impl AutoLoopEmitter {
    pub fn new(graph: &Graph, inst: InstId, id: ControlId) -> CompileResult<Self> {
        let arity = graph.inst(inst).inputs.len();
        if arity < 2 {
            return Err(CompileError::malformed(format!(
                "auto_loop {inst} needs at least one data input and a back-edge"
            )));
        }
        Ok(Self {
            id,
            iterations: arity - 1,
        })
    }

    pub fn emit_code(&self, ctx: &mut EmitContext, regs: &RegInfo) -> CompileResult<()> {
        let dst = reg_at(&regs.outputs, 0, "auto_loop")?;
        ctx.move_vector(dst, reg_at(&regs.inputs, 0, "auto_loop")?)?;

        let counter = ctx.begin_loop(self.id)?;
        ctx.enc.mov_reg_imm(counter, self.iterations as i64)?;

        let vec_bytes = ctx.vec_bytes();
        ctx.enc
            .sub_reg_imm(gp::RSP, self.iterations as i32 * vec_bytes)?;
        for i in 0..self.iterations {
            let src = reg_at(&regs.inputs, i, "auto_loop")?;
            ctx.enc
                .vmovups_store(gp::RSP, i as i32 * vec_bytes, super::vreg(src))?;
        }

        ctx.bind_label(self.id)?;
        ctx.enc.vmovups_load(super::vreg(dst), gp::RSP, 0)?;
        ctx.enc.add_reg_imm(gp::RSP, vec_bytes)?;
        Ok(())
    }
}

/// What a conditional jump jumps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpTarget {
    /// Decrement the counter of loop `id` and jump back while it stays positive.
    BackEdge { id: ControlId },
    /// Jump to `taken` while the counter of loop `counter` is positive, else to `not_taken`.
    Branch {
        counter: ControlId,
        taken: ControlId,
        not_taken: ControlId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpEmitter {
    pub target: JumpTarget,
    pub moves_data: bool,
}

fn consumer_control_id(
    graph: &Graph,
    value: Value,
    pred: impl Fn(&OpKind) -> bool,
) -> Option<ControlId> {
    graph
        .consumers(value)
        .iter()
        .map(|u| &graph.inst(u.inst).kind)
        .find(|&kind| pred(kind))
        .and_then(OpKind::control_id)
}

/// Identity of the nearest loop head reached by walking input 0 upwards.
fn enclosing_loop(graph: &Graph, start: InstId) -> Option<ControlId> {
    let mut current = start;
    for _ in 0..graph.len() {
        let value = graph.inst(current).inputs.first()?;
        current = value.producer;
        let kind = &graph.inst(current).kind;
        if kind.is_loop_head() {
            return kind.control_id();
        }
    }
    None
}

impl JumpEmitter {
    pub fn new(graph: &Graph, id: InstId) -> CompileResult<Self> {
        let inst = graph.inst(id);
        let found = inst.num_outputs as usize;
        if found != 2 {
            return Err(CompileError::UnexpectedOutputArity {
                inst: id,
                expected: 2,
                found,
            });
        }
        let moves_data = inst
            .inputs
            .first()
            .is_some_and(|v| !is_pointer_producer(graph, v.producer));

        let jump = Value::new(id, 0);
        let fall = Value::new(id, 1);
        let is_label = |kind: &OpKind| matches!(kind, OpKind::Label { .. });

        let target = if let Some(loop_id) = consumer_control_id(graph, jump, OpKind::is_loop_head)
        {
            JumpTarget::BackEdge { id: loop_id }
        } else if let (Some(taken), Some(not_taken)) = (
            consumer_control_id(graph, jump, is_label),
            consumer_control_id(graph, fall, is_label),
        ) {
            let counter = enclosing_loop(graph, id).ok_or_else(|| {
                CompileError::malformed(format!("branch {id} is not inside a loop"))
            })?;
            JumpTarget::Branch {
                counter,
                taken,
                not_taken,
            }
        } else {
            return Err(CompileError::malformed(format!(
                "cjump {id} must feed a loop head or two labels"
            )));
        };
        Ok(Self { target, moves_data })
    }

    pub fn emit_code(&self, ctx: &mut EmitContext, regs: &RegInfo) -> CompileResult<()> {
        match self.target {
            JumpTarget::BackEdge { id } => {
                if self.moves_data {
                    ctx.move_vector(
                        reg_at(&regs.outputs, 1, "cjump")?,
                        reg_at(&regs.inputs, 0, "cjump")?,
                    )?;
                }
                let top = ctx.labels.resolve(id)?;
                let counter = AsmReg::gp(ctx.counters.get(id)?);
                ctx.enc.sub_reg_imm(counter, 1)?;
                ctx.enc.cmp_reg_imm(counter, 1)?;
                ctx.enc.jge(top)?;
                ctx.counters.release(id)
            }
            JumpTarget::Branch {
                counter,
                taken,
                not_taken,
            } => {
                let counter = AsmReg::gp(ctx.counters.get(counter)?);
                ctx.enc.cmp_reg_imm(counter, 1)?;
                let enc = &mut ctx.enc;
                let taken = ctx.labels.forward(taken, || enc.create_label())?;
                let not_taken = ctx.labels.forward(not_taken, || enc.create_label())?;
                ctx.enc.jge(taken)?;
                ctx.enc.jl(not_taken)?;
                Ok(())
            }
        }
    }
}

/// Forward jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelEmitter {
    pub id: ControlId,
    pub moves_data: bool,
}

impl LabelEmitter {
    pub fn emit_code(&self, ctx: &mut EmitContext, regs: &RegInfo) -> CompileResult<()> {
        if self.moves_data {
            ctx.move_vector(
                reg_at(&regs.outputs, 0, "label")?,
                reg_at(&regs.inputs, 0, "label")?,
            )?;
        }
        ctx.bind_label(self.id)
    }
}
