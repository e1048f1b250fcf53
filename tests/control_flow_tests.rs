//! Control-flow emission tests.
//!
//! Loop trip counts are checked by decoding the emitted kernel with
//! `iced_x86::Decoder` and interpreting its general-purpose integer
//! instructions; vector instructions are only counted.

use bumpalo::Bump;
use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind as IcedOpKind, Register};
use std::collections::HashMap;
use tilejit::core::{
    CompilationSession, CompileError, CompileParams, CompiledKernel, ElementwiseOp, Generator,
    Graph, GraphBuilder, LabelTable, SlotState, Value,
};
use tilejit::x64::{Isa, X64Backend};

fn compile(graph: &mut Graph, params: CompileParams) -> Result<CompiledKernel, CompileError> {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    Generator::new(X64Backend::new(Isa::Avx2)).generate(graph, params, &session)
}

fn decode(kernel: &CompiledKernel) -> Vec<Instruction> {
    Decoder::with_ip(
        64,
        &kernel.code[..kernel.code_size()],
        0,
        DecoderOptions::NONE,
    )
    .into_iter()
    .collect()
}

/// Run the integer part of `insts` and count executions per mnemonic.
fn simulate(insts: &[Instruction]) -> HashMap<Mnemonic, usize> {
    let index_of: HashMap<u64, usize> = insts
        .iter()
        .enumerate()
        .map(|(i, inst)| (inst.ip(), i))
        .collect();
    let mut regs: HashMap<Register, i64> = HashMap::new();
    let mut flags = (0i64, 0i64);
    let mut counts = HashMap::new();

    let operand = |inst: &Instruction, op: u32, regs: &HashMap<Register, i64>| -> i64 {
        match inst.op_kind(op) {
            IcedOpKind::Register => regs.get(&inst.op_register(op)).copied().unwrap_or(0),
            IcedOpKind::Memory => 0,
            _ => inst.immediate(op) as i64,
        }
    };

    let mut pc = 0;
    for _ in 0..100_000 {
        let inst = &insts[pc];
        *counts.entry(inst.mnemonic()).or_insert(0) += 1;
        pc += 1;
        let dst = inst.op0_register();
        match inst.mnemonic() {
            Mnemonic::Ret => return counts,
            Mnemonic::Mov if inst.op0_kind() == IcedOpKind::Register => {
                let v = operand(inst, 1, &regs);
                regs.insert(dst, v);
            }
            Mnemonic::Add | Mnemonic::Sub | Mnemonic::Imul
                if inst.op0_kind() == IcedOpKind::Register =>
            {
                let last = inst.op_count() - 1;
                let rhs = operand(inst, last, &regs);
                let lhs = operand(inst, last - 1, &regs);
                let v = match inst.mnemonic() {
                    Mnemonic::Add => lhs + rhs,
                    Mnemonic::Sub => lhs - rhs,
                    _ => lhs * rhs,
                };
                regs.insert(dst, v);
            }
            Mnemonic::Cmp => flags = (operand(inst, 0, &regs), operand(inst, 1, &regs)),
            Mnemonic::Jmp | Mnemonic::Jge | Mnemonic::Jl => {
                let taken = match inst.mnemonic() {
                    Mnemonic::Jge => flags.0 >= flags.1,
                    Mnemonic::Jl => flags.0 < flags.1,
                    _ => true,
                };
                if taken {
                    pc = index_of[&inst.near_branch_target()];
                }
            }
            _ => {}
        }
    }
    panic!("kernel did not return");
}

/// `out = in * 2^iterations`, doubling inside a counted loop.
fn doubling_loop(iterations: u32) -> Graph {
    let mut b = GraphBuilder::new();
    let p = b.parameter();
    let x = b.load(p, 0);
    let two = b.scalar(2.0);
    let head = b.loop_head(0, iterations, &[x]);
    let doubled = b.binary(ElementwiseOp::Mul, Value::new(head, 0), two);
    let jump = b.conditional_jump(&[doubled]);
    b.add_input(head, Value::new(jump, 0));
    let st = b.store(Value::new(jump, 1));
    b.result(st);
    b.finish().unwrap()
}

#[test]
fn test_loop_body_runs_exactly_n_times() {
    for n in [1, 2, 5] {
        let mut graph = doubling_loop(n);
        let kernel = compile(&mut graph, CompileParams::new(1, 8)).unwrap();
        let counts = simulate(&decode(&kernel));
        // one vector iteration of inner work, no scalar tail
        assert_eq!(counts[&Mnemonic::Vmulps], n as usize, "loop of {n}");
        assert_eq!(counts.get(&Mnemonic::Vmovss), None);
    }
}

#[test]
fn test_scalar_tail_runs_its_own_loop() {
    let mut graph = doubling_loop(3);
    let kernel = compile(&mut graph, CompileParams::new(1, 10)).unwrap();
    let counts = simulate(&decode(&kernel));
    // 8 elements in one vector pass, 2 elements one at a time
    assert_eq!(counts[&Mnemonic::Vmulps], 3 + 2 * 3);
    // tail loads and stores only
    assert_eq!(counts[&Mnemonic::Vmovss], 2 + 2);

    let ids: Vec<_> = kernel.labels.iter().map(|&(id, _)| id).collect();
    assert_eq!(ids, vec![0, 1]);
    assert!(kernel
        .labels
        .iter()
        .all(|&(_, state)| state == SlotState::Consumed));
}

#[test]
fn test_outer_loop_repeats_the_body() {
    let mut graph = doubling_loop(2);
    let kernel = compile(&mut graph, CompileParams::new(4, 8)).unwrap();
    let counts = simulate(&decode(&kernel));
    assert_eq!(counts[&Mnemonic::Vmulps], 4 * 2);
}

#[test]
fn test_duplicate_loop_id_is_rejected() {
    let mut b = GraphBuilder::new();
    let p = b.parameter();
    let x = b.load(p, 0);
    let first = b.loop_head(7, 2, &[x]);
    let j1 = b.conditional_jump(&[Value::new(first, 0)]);
    b.add_input(first, Value::new(j1, 0));
    let second = b.loop_head(7, 2, &[Value::new(j1, 1)]);
    let j2 = b.conditional_jump(&[Value::new(second, 0)]);
    b.add_input(second, Value::new(j2, 0));
    let st = b.store(Value::new(j2, 1));
    b.result(st);
    let mut graph = b.finish().unwrap();

    let err = compile(&mut graph, CompileParams::new(1, 8)).unwrap_err();
    assert_eq!(err.to_string(), "label with id 7 already exists");
}

#[test]
fn test_back_edge_before_its_loop_fails() {
    let mut table: LabelTable<u32> = LabelTable::new();
    assert_eq!(table.resolve(3), Err(CompileError::LabelNotBound { id: 3 }));

    let mut b = GraphBuilder::new();
    let p = b.parameter();
    let x = b.load(p, 0);
    let jump = b.conditional_jump(&[x]);
    let head = b.loop_head(3, 2, &[Value::new(jump, 0)]);
    let st = b.store(Value::new(head, 0));
    b.result(st);
    let mut graph = b.finish().unwrap();

    let err = compile(&mut graph, CompileParams::new(1, 8)).unwrap_err();
    assert_eq!(err, CompileError::LabelNotBound { id: 3 });
}

#[test]
fn test_branch_inside_loop_binds_both_labels() {
    let mut b = GraphBuilder::new();
    let p = b.parameter();
    let x = b.load(p, 0);
    let head = b.loop_head(0, 3, &[x]);
    let branch = b.conditional_jump(&[Value::new(head, 0)]);
    let taken = b.label(1, Value::new(branch, 0));
    let not_taken = b.label(2, Value::new(branch, 1));
    let sum = b.binary(
        ElementwiseOp::Add,
        Value::new(taken, 0),
        Value::new(not_taken, 0),
    );
    let back = b.conditional_jump(&[sum]);
    b.add_input(head, Value::new(back, 0));
    let st = b.store(Value::new(back, 1));
    b.result(st);
    let mut graph = b.finish().unwrap();

    let kernel = compile(&mut graph, CompileParams::new(1, 8)).unwrap();
    assert_eq!(
        kernel.labels,
        vec![
            (0, SlotState::Consumed),
            (1, SlotState::Bound),
            (2, SlotState::Bound),
            (3, SlotState::Consumed),
            (4, SlotState::Bound),
            (5, SlotState::Bound),
        ]
    );
    let counts = simulate(&decode(&kernel));
    assert_eq!(counts[&Mnemonic::Vaddps], 3);
}

#[test]
fn test_jump_needs_two_outputs() {
    let mut b = GraphBuilder::new();
    let p = b.parameter();
    let x = b.load(p, 0);
    let head = b.loop_head(0, 2, &[x]);
    let jump = b.push(
        tilejit::core::OpKind::ConditionalJump,
        &[Value::new(head, 0)],
        1,
    );
    b.add_input(head, Value::new(jump, 0));
    let st = b.store(Value::new(head, 0));
    b.result(st);
    let mut graph = b.finish().unwrap();

    assert!(matches!(
        compile(&mut graph, CompileParams::new(1, 8)),
        Err(CompileError::UnexpectedOutputArity { expected: 2, found: 1, .. })
    ));
}
