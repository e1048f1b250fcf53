// This module defines the lowered instruction list that every tilejit pass works on. A Graph
// is an arena of Instructions addressed by InstId, kept in emission order. Values are
// (producer, output slot) pairs, so a graph never owns shared pointers and back-edges from a
// ConditionalJump into an earlier Loop are plain indices. Consumer edges are a derived table
// rebuilt once when the graph is finished and never patched in place. OpKind is a closed
// sum type over the recognised operation vocabulary: boundary markers (Parameter, Result),
// memory access (Load, Store and their scalar forms, BroadcastLoad, Split), compute
// (Elementwise, Scalar constants, BroadcastMove, ConvolutionKernel) and control flow (Loop,
// AutoLoop, ConditionalJump, Label). Register info and ordering hints are typed fields on the
// Instruction, written by the allocator and the post-increment pass. GraphBuilder offers
// one method per op kind plus the split-and-load lowering that records accumulated byte
// offsets, and Graph::to_scalar produces the scalar-tail clone used for the second tile.

//! Lowered instruction graph.
//!
//! Instructions live in a flat arena in emission order and refer to each other
//! by index. See [`GraphBuilder`] for construction and [`Graph::to_scalar`] for
//! the tail-tile clone.

use super::error::{CompileError, CompileResult};
use std::fmt;

/// Index of an instruction in its [`Graph`].
pub type InstId = usize;

/// Identity shared by a loop/label construct and the jump that targets it.
pub type ControlId = u32;

/// Size in bytes of one element; every tensor handled here is `f32`.
pub const ELEMENT_SIZE: usize = 4;

/// One output of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value {
    pub producer: InstId,
    pub slot: u32,
}

impl Value {
    pub const fn new(producer: InstId, slot: u32) -> Self {
        Self { producer, slot }
    }
}

/// A consumer edge: input `input` of instruction `inst`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Use {
    pub inst: InstId,
    pub input: usize,
}

/// Lane-wise arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementwiseOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    /// `a * b + c`
    FusedMulAdd,
}

impl ElementwiseOp {
    pub fn arity(self) -> usize {
        match self {
            ElementwiseOp::FusedMulAdd => 3,
            _ => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ElementwiseOp::Add => "add",
            ElementwiseOp::Sub => "sub",
            ElementwiseOp::Mul => "mul",
            ElementwiseOp::Div => "div",
            ElementwiseOp::Max => "max",
            ElementwiseOp::Min => "min",
            ElementwiseOp::FusedMulAdd => "fma",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "add" => ElementwiseOp::Add,
            "sub" => ElementwiseOp::Sub,
            "mul" => ElementwiseOp::Mul,
            "div" => ElementwiseOp::Div,
            "max" => ElementwiseOp::Max,
            "min" => ElementwiseOp::Min,
            "fma" => ElementwiseOp::FusedMulAdd,
            _ => return None,
        })
    }
}

/// Geometry of a small direct-convolution inner product.
///
/// The kernel produces `kernel_h * kernel_w` accumulators. For every input
/// channel pack it loads one weight vector and, per output position, broadcasts
/// one data element at `h * row_stride + w * col_stride` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvShape {
    pub kernel_h: u32,
    pub kernel_w: u32,
    pub channel_packs: u32,
    pub row_stride: i32,
    pub col_stride: i32,
}

impl ConvShape {
    pub fn accumulators(&self) -> usize {
        (self.kernel_h * self.kernel_w) as usize
    }
}

/// Operation kinds recognised by the allocator and the emitters.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// Input pointer. One output, lives in a general-purpose register.
    Parameter,
    /// Output marker consuming a Store. No outputs.
    Result,
    /// Full-width vector load from a pointer at a byte offset.
    Load { offset: i32, post_increment: bool },
    /// Single-element load used by the tail tile.
    ScalarLoad { offset: i32, post_increment: bool },
    /// Full-width vector store; the output is a pointer pass-through to the Result.
    Store { offset: i32 },
    /// Single-element store used by the tail tile.
    ScalarStore { offset: i32 },
    /// Replicate one element read from memory into every lane.
    BroadcastLoad { post_increment: bool },
    /// Replicate lane 0 of a vector value into every lane.
    BroadcastMove,
    /// Memory-preserving split of a pointer into several views.
    Split,
    /// Constant replicated across lanes, materialised from a data table.
    Scalar(f32),
    Elementwise(ElementwiseOp),
    /// Counted loop head.
    Loop { id: ControlId, iterations: u32 },
    /// Loop head that pops one spilled input per iteration.
    AutoLoop { id: ControlId },
    /// Back-edge or two-way branch, paired by its output edges.
    ConditionalJump,
    /// Forward jump target.
    Label { id: ControlId },
    ConvolutionKernel(ConvShape),
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Parameter => "parameter",
            OpKind::Result => "result",
            OpKind::Load { .. } => "load",
            OpKind::ScalarLoad { .. } => "scalar_load",
            OpKind::Store { .. } => "store",
            OpKind::ScalarStore { .. } => "scalar_store",
            OpKind::BroadcastLoad { .. } => "broadcast_load",
            OpKind::BroadcastMove => "broadcast_move",
            OpKind::Split => "split",
            OpKind::Scalar(_) => "scalar",
            OpKind::Elementwise(op) => op.name(),
            OpKind::Loop { .. } => "loop",
            OpKind::AutoLoop { .. } => "auto_loop",
            OpKind::ConditionalJump => "cjump",
            OpKind::Label { .. } => "label",
            OpKind::ConvolutionKernel(_) => "conv",
        }
    }

    pub fn is_store(&self) -> bool {
        matches!(self, OpKind::Store { .. } | OpKind::ScalarStore { .. })
    }

    pub fn is_load(&self) -> bool {
        matches!(self, OpKind::Load { .. } | OpKind::ScalarLoad { .. })
    }

    pub fn is_boundary(&self) -> bool {
        matches!(self, OpKind::Parameter | OpKind::Result)
    }

    pub fn is_loop_head(&self) -> bool {
        matches!(self, OpKind::Loop { .. } | OpKind::AutoLoop { .. })
    }

    /// Identity of a loop head or label.
    pub fn control_id(&self) -> Option<ControlId> {
        match *self {
            OpKind::Loop { id, .. } | OpKind::AutoLoop { id } | OpKind::Label { id } => Some(id),
            _ => None,
        }
    }

    fn shift_control_id(&mut self, offset: ControlId) {
        match self {
            OpKind::Loop { id, .. } | OpKind::AutoLoop { id } | OpKind::Label { id } => *id += offset,
            _ => {}
        }
    }

    /// Tail-tile form: vector memory access becomes single-element access.
    fn to_scalar(&self) -> OpKind {
        match *self {
            OpKind::Load {
                offset,
                post_increment,
            } => OpKind::ScalarLoad {
                offset,
                post_increment,
            },
            OpKind::Store { offset } => OpKind::ScalarStore { offset },
            ref other => other.clone(),
        }
    }
}

/// One node of the lowered list.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub kind: OpKind,
    pub inputs: Vec<Value>,
    pub num_outputs: u32,
    /// One physical register index per output, written by register assignment.
    pub reg_info: Option<Vec<usize>>,
    /// Ordering hint used to pick the post-incrementing load of a split.
    pub order: Option<usize>,
}

impl Instruction {
    pub fn new(kind: OpKind, inputs: Vec<Value>, num_outputs: u32) -> Self {
        Self {
            kind,
            inputs,
            num_outputs,
            reg_info: None,
            order: None,
        }
    }
}

/// Ordered instruction arena with derived consumer edges.
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    insts: Vec<Instruction>,
    /// `consumers[inst][slot]`
    consumers: Vec<Vec<Vec<Use>>>,
}

impl Graph {
    /// Build a graph from an instruction list, validating every input edge.
    pub fn from_instructions(insts: Vec<Instruction>) -> CompileResult<Self> {
        let mut consumers: Vec<Vec<Vec<Use>>> = insts
            .iter()
            .map(|inst| vec![Vec::new(); inst.num_outputs as usize])
            .collect();

        for (id, inst) in insts.iter().enumerate() {
            for (input, value) in inst.inputs.iter().enumerate() {
                let slots = consumers.get_mut(value.producer).ok_or_else(|| {
                    CompileError::malformed(format!(
                        "instruction {id} reads from missing instruction {}",
                        value.producer
                    ))
                })?;
                let uses = slots.get_mut(value.slot as usize).ok_or_else(|| {
                    CompileError::malformed(format!(
                        "instruction {id} reads output {} of instruction {} which has {} outputs",
                        value.slot,
                        value.producer,
                        insts[value.producer].num_outputs
                    ))
                })?;
                uses.push(Use { inst: id, input });
            }
        }

        Ok(Self { insts, consumers })
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    pub fn inst(&self, id: InstId) -> &Instruction {
        &self.insts[id]
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut Instruction {
        &mut self.insts[id]
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.insts
    }

    pub fn iter(&self) -> impl Iterator<Item = (InstId, &Instruction)> + '_ {
        self.insts.iter().enumerate()
    }

    /// Outputs of `id` in slot order.
    pub fn outputs(&self, id: InstId) -> impl Iterator<Item = Value> {
        (0..self.insts[id].num_outputs).map(move |slot| Value::new(id, slot))
    }

    /// Uses of `value`; empty for a slot the producer does not have.
    pub fn consumers(&self, value: Value) -> &[Use] {
        self.consumers
            .get(value.producer)
            .and_then(|slots| slots.get(value.slot as usize))
            .map_or(&[][..], Vec::as_slice)
    }

    /// All consumers of every output of `id`.
    pub fn successors(&self, id: InstId) -> impl Iterator<Item = InstId> + '_ {
        self.consumers[id]
            .iter()
            .flat_map(|uses| uses.iter().map(|u| u.inst))
    }

    pub fn producer(&self, value: Value) -> &Instruction {
        &self.insts[value.producer]
    }

    pub fn parameters(&self) -> Vec<InstId> {
        self.ids_of(|kind| matches!(kind, OpKind::Parameter))
    }

    pub fn results(&self) -> Vec<InstId> {
        self.ids_of(|kind| matches!(kind, OpKind::Result))
    }

    fn ids_of(&self, pred: impl Fn(&OpKind) -> bool) -> Vec<InstId> {
        self.iter()
            .filter(|(_, inst)| pred(&inst.kind))
            .map(|(id, _)| id)
            .collect()
    }

    /// Parameter behind `id`: the instruction itself, or the source of a Split.
    pub fn as_parameter(&self, id: InstId) -> Option<InstId> {
        match self.insts[id].kind {
            OpKind::Parameter => Some(id),
            OpKind::Split => {
                let source = self.insts[id].inputs.first()?.producer;
                matches!(self.insts[source].kind, OpKind::Parameter).then_some(source)
            }
            _ => None,
        }
    }

    /// Largest loop/label identity, if any.
    pub fn max_control_id(&self) -> Option<ControlId> {
        self.insts.iter().filter_map(|i| i.kind.control_id()).max()
    }

    /// Clone with Load/Store rewritten to their single-element forms and every
    /// loop/label identity shifted by `id_offset`.
    pub fn to_scalar(&self, id_offset: ControlId) -> Graph {
        let insts = self
            .insts
            .iter()
            .map(|inst| {
                let mut kind = inst.kind.to_scalar();
                kind.shift_control_id(id_offset);
                Instruction {
                    kind,
                    ..inst.clone()
                }
            })
            .collect();
        Graph {
            insts,
            consumers: self.consumers.clone(),
        }
    }

    fn value_name(&self, value: Value) -> String {
        if self.insts[value.producer].num_outputs == 1 {
            format!("%{}", value.producer)
        } else {
            format!("%{}.{}", value.producer, value.slot)
        }
    }
}

/// Prints the text IR accepted by [`parse_graph`](super::parser::parse_graph).
impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, inst) in self.iter() {
            let outputs: Vec<String> = self.outputs(id).map(|v| self.value_name(v)).collect();
            if !outputs.is_empty() {
                write!(f, "{} = ", outputs.join(", "))?;
            }
            write!(f, "{}", inst.kind.name())?;

            let inputs: Vec<String> = inst.inputs.iter().map(|&v| self.value_name(v)).collect();
            if !inputs.is_empty() {
                write!(f, " {}", inputs.join(", "))?;
            }

            match &inst.kind {
                OpKind::Load {
                    offset,
                    post_increment,
                }
                | OpKind::ScalarLoad {
                    offset,
                    post_increment,
                } => {
                    write!(f, " offset={offset}")?;
                    if *post_increment {
                        write!(f, " post_increment=true")?;
                    }
                }
                OpKind::Store { offset } | OpKind::ScalarStore { offset } => {
                    if *offset != 0 {
                        write!(f, " offset={offset}")?;
                    }
                }
                OpKind::BroadcastLoad { post_increment } => {
                    if *post_increment {
                        write!(f, " post_increment=true")?;
                    }
                }
                OpKind::Scalar(value) => write!(f, " value={value}")?,
                OpKind::Loop { id, iterations } => write!(f, " id={id} iterations={iterations}")?,
                OpKind::AutoLoop { id } | OpKind::Label { id } => write!(f, " id={id}")?,
                OpKind::ConvolutionKernel(shape) => write!(
                    f,
                    " kh={} kw={} packs={} row_stride={} col_stride={}",
                    shape.kernel_h,
                    shape.kernel_w,
                    shape.channel_packs,
                    shape.row_stride,
                    shape.col_stride
                )?,
                _ => {}
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Incremental graph construction in emission order.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    insts: Vec<Instruction>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an instruction and return its id.
    pub fn push(&mut self, kind: OpKind, inputs: &[Value], num_outputs: u32) -> InstId {
        self.insts
            .push(Instruction::new(kind, inputs.to_vec(), num_outputs));
        self.insts.len() - 1
    }

    fn push_value(&mut self, kind: OpKind, inputs: &[Value]) -> Value {
        Value::new(self.push(kind, inputs, 1), 0)
    }

    pub fn parameter(&mut self) -> Value {
        self.push_value(OpKind::Parameter, &[])
    }

    pub fn result(&mut self, value: Value) -> InstId {
        self.push(OpKind::Result, &[value], 0)
    }

    pub fn load(&mut self, ptr: Value, offset: i32) -> Value {
        self.push_value(
            OpKind::Load {
                offset,
                post_increment: false,
            },
            &[ptr],
        )
    }

    pub fn store(&mut self, value: Value) -> Value {
        self.push_value(OpKind::Store { offset: 0 }, &[value])
    }

    pub fn broadcast_load(&mut self, ptr: Value) -> Value {
        self.push_value(
            OpKind::BroadcastLoad {
                post_increment: false,
            },
            &[ptr],
        )
    }

    pub fn broadcast_move(&mut self, value: Value) -> Value {
        self.push_value(OpKind::BroadcastMove, &[value])
    }

    pub fn split(&mut self, ptr: Value, parts: u32) -> Vec<Value> {
        let id = self.push(OpKind::Split, &[ptr], parts);
        (0..parts).map(|slot| Value::new(id, slot)).collect()
    }

    /// Split `ptr` into views of `part_elements` elements each and load every
    /// view at its accumulated byte offset.
    pub fn split_loads(&mut self, ptr: Value, part_elements: &[usize]) -> Vec<Value> {
        let views = self.split(ptr, part_elements.len() as u32);
        let mut offset = 0usize;
        let mut loads = Vec::with_capacity(views.len());
        for (view, elements) in views.into_iter().zip(part_elements) {
            loads.push(self.load(view, offset as i32));
            offset += elements * ELEMENT_SIZE;
        }
        loads
    }

    pub fn scalar(&mut self, value: f32) -> Value {
        self.push_value(OpKind::Scalar(value), &[])
    }

    pub fn binary(&mut self, op: ElementwiseOp, lhs: Value, rhs: Value) -> Value {
        self.push_value(OpKind::Elementwise(op), &[lhs, rhs])
    }

    pub fn fma(&mut self, a: Value, b: Value, c: Value) -> Value {
        self.push_value(OpKind::Elementwise(ElementwiseOp::FusedMulAdd), &[a, b, c])
    }

    /// Counted loop head passing every input through to an output of the same slot.
    pub fn loop_head(&mut self, id: ControlId, iterations: u32, inputs: &[Value]) -> InstId {
        self.push(
            OpKind::Loop { id, iterations },
            inputs,
            inputs.len() as u32,
        )
    }

    pub fn auto_loop(&mut self, id: ControlId, inputs: &[Value]) -> InstId {
        self.push(OpKind::AutoLoop { id }, inputs, 1)
    }

    /// Output 0 is the jump edge, output 1 the fall-through data.
    pub fn conditional_jump(&mut self, inputs: &[Value]) -> InstId {
        self.push(OpKind::ConditionalJump, inputs, 2)
    }

    pub fn label(&mut self, id: ControlId, input: Value) -> InstId {
        self.push(OpKind::Label { id }, &[input], 1)
    }

    pub fn convolution(
        &mut self,
        shape: ConvShape,
        data: Value,
        weights: Value,
        biases: Value,
    ) -> InstId {
        let outputs = shape.accumulators() as u32;
        self.push(
            OpKind::ConvolutionKernel(shape),
            &[data, weights, biases],
            outputs,
        )
    }

    /// Append an input to an existing instruction; used for loop back-edges.
    pub fn add_input(&mut self, inst: InstId, value: Value) {
        self.insts[inst].inputs.push(value);
    }

    pub fn finish(self) -> CompileResult<Graph> {
        Graph::from_instructions(self.insts)
    }
}
