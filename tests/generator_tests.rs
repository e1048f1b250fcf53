//! End-to-end generator tests: tiles, targets, constants, convolution and ELF output.

use bumpalo::Bump;
use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, Register};
use object::read::File;
use object::{Object as _, ObjectSymbol as _};
use tilejit::core::{
    CompilationSession, CompileError, CompileParams, CompiledKernel, ConvShape, ElementwiseOp,
    Generator, GeneratorConfig, Graph, GraphBuilder, OpKind, Value,
};
use tilejit::x64::{emit_elf, Isa, X64Backend, X64Emitter};

fn scale_graph() -> Graph {
    let mut b = GraphBuilder::new();
    let p = b.parameter();
    let x = b.load(p, 0);
    let c = b.scalar(0.25);
    let y = b.binary(ElementwiseOp::Mul, x, c);
    let st = b.store(y);
    b.result(st);
    b.finish().unwrap()
}

fn generate(graph: &mut Graph, isa: Isa) -> Result<CompiledKernel, CompileError> {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    Generator::new(X64Backend::new(isa)).generate(graph, CompileParams::new(1, 64), &session)
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

#[test]
fn test_vector_and_scalar_tiles_mirror_each_other() {
    let mut graph = scale_graph();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let generator = Generator::new(X64Backend::new(Isa::Avx2));
    let kernel = generator
        .lower(&mut graph, CompileParams::default(), &session)
        .unwrap();

    let vector = &kernel.scheduler.vector;
    let scalar = &kernel.scheduler.scalar;
    assert_eq!((vector.lanes, scalar.lanes), (8, 1));
    assert_eq!(vector.len(), scalar.len());
    for ((v, v_regs), (s, s_regs)) in vector.body.iter().zip(&scalar.body) {
        assert_eq!(v_regs, s_regs);
        match (v, s) {
            (X64Emitter::Load(va), X64Emitter::Load(sa))
            | (X64Emitter::Store(va), X64Emitter::Store(sa)) => {
                assert!(!va.scalar && sa.scalar);
                assert_eq!(va.offset, sa.offset);
                assert_eq!(va.post_increment, sa.post_increment);
            }
            (v, s) => assert_eq!(std::mem::discriminant(v), std::mem::discriminant(s)),
        }
    }
}

#[test]
fn test_target_width_follows_isa() {
    let avx2 = generate(&mut scale_graph(), Isa::Avx2).unwrap();
    let avx512 = generate(&mut scale_graph(), Isa::Avx512).unwrap();
    assert_eq!((avx2.lanes, avx512.lanes), (8, 16));

    let widest = |kernel: &CompiledKernel| {
        decode(kernel)
            .iter()
            .filter(|i| i.mnemonic() == Mnemonic::Vmulps)
            .map(|i| i.op0_register())
            .collect::<Vec<_>>()
    };
    assert!(widest(&avx2).iter().all(|r| r.is_ymm()));
    assert!(widest(&avx512).iter().all(|r| r.is_zmm()));
    assert_eq!(widest(&avx2).len(), 2);
}

#[test]
fn test_unsupported_isa_is_rejected() {
    let mut graph = scale_graph();
    let err = generate(&mut graph, Isa::Sse41).unwrap_err();
    assert_eq!(
        err,
        CompileError::UnsupportedIsa {
            isa: "sse41".to_string()
        }
    );
    assert_eq!(
        err.to_string(),
        "unsupported architecture for code generation: sse41"
    );
}

#[test]
fn test_constants_follow_the_code() {
    let mut graph = scale_graph();
    let kernel = generate(&mut graph, Isa::Avx2).unwrap();
    // one constant per tile
    assert_eq!(kernel.data_size, 8);
    let data = &kernel.code[kernel.code_size()..];
    assert_eq!(&data[..4], &0.25f32.to_le_bytes());
    assert_eq!(&data[4..], &0.25f32.to_le_bytes());

    let insts = decode(&kernel);
    assert_eq!(insts.last().unwrap().mnemonic(), Mnemonic::Ret);
    let broadcasts: Vec<_> = insts
        .iter()
        .filter(|i| i.mnemonic() == Mnemonic::Vbroadcastss && i.is_ip_rel_memory_operand())
        .map(|i| i.ip_rel_memory_address())
        .collect();
    assert_eq!(
        broadcasts,
        vec![kernel.code_size() as u64, kernel.code_size() as u64 + 4]
    );
}

#[test]
fn test_generation_is_deterministic() {
    let a = generate(&mut scale_graph(), Isa::Avx2).unwrap();
    let b = generate(&mut scale_graph(), Isa::Avx2).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_session_records_the_pipeline() {
    let mut graph = scale_graph();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let kernel = Generator::new(X64Backend::new(Isa::Avx2))
        .generate(&mut graph, CompileParams::new(1, 64), &session)
        .unwrap();

    let stats = session.stats();
    assert_eq!(stats.kernels_compiled, 1);
    assert_eq!(stats.instructions_lowered, 2 * graph.len());
    assert_eq!(stats.instruction_counts["mul"], 2);
    assert_eq!(stats.code_size, kernel.code.len());
    assert_eq!(stats.data_size, 8);
    assert_eq!(stats.labels_bound, 0);
}

#[test]
fn test_auto_loop_pops_one_input_per_iteration() {
    let mut b = GraphBuilder::new();
    let p = b.parameter();
    let views = b.split_loads(p, &[8, 8, 8]);
    let head = b.auto_loop(0, &views);
    let acc = b.binary(ElementwiseOp::Max, Value::new(head, 0), views[0]);
    let jump = b.conditional_jump(&[acc]);
    b.add_input(head, Value::new(jump, 0));
    let st = b.store(Value::new(jump, 1));
    b.result(st);
    let mut graph = b.finish().unwrap();

    let kernel = generate(&mut graph, Isa::Avx2).unwrap();
    let insts = decode(&kernel);
    let rsp_adjust: Vec<(Mnemonic, u64)> = insts
        .iter()
        .filter(|i| {
            matches!(i.mnemonic(), Mnemonic::Add | Mnemonic::Sub) && i.op0_register() == Register::RSP
        })
        .map(|i| (i.mnemonic(), i.immediate(1)))
        .collect();
    // vector tile then scalar tile, three spilled ymm registers each
    assert_eq!(
        rsp_adjust,
        vec![
            (Mnemonic::Sub, 96),
            (Mnemonic::Add, 32),
            (Mnemonic::Sub, 96),
            (Mnemonic::Add, 32)
        ]
    );
}

/// 2x2 convolution over three channel packs; returns the graph and the conv id.
fn conv_graph() -> (Graph, usize) {
    let shape = ConvShape {
        kernel_h: 2,
        kernel_w: 2,
        channel_packs: 3,
        row_stride: 256,
        col_stride: 32,
    };
    let mut b = GraphBuilder::new();
    let data = b.parameter();
    let weights = b.parameter();
    let biases = b.parameter();
    let conv = b.convolution(shape, data, weights, biases);
    let outs: Vec<Value> = (0..4).map(|slot| Value::new(conv, slot)).collect();
    let s01 = b.binary(ElementwiseOp::Add, outs[0], outs[1]);
    let s23 = b.binary(ElementwiseOp::Add, outs[2], outs[3]);
    let sum = b.binary(ElementwiseOp::Add, s01, s23);
    let st = b.store(sum);
    b.result(st);
    (b.finish().unwrap(), conv)
}

#[test]
fn test_convolution_accumulates_into_every_output() {
    let (mut graph, conv) = conv_graph();

    let kernel = generate(&mut graph, Isa::Avx2).unwrap();
    let insts = decode(&kernel);
    let count = |m: Mnemonic| insts.iter().filter(|i| i.mnemonic() == m).count();
    // both tiles: per pack one weight load and one broadcast + FMA per output
    assert_eq!(count(Mnemonic::Vfmadd231ps), 2 * 3 * 4);
    assert_eq!(count(Mnemonic::Vbroadcastss), 2 * 3 * 4);

    let accumulators: Vec<usize> = graph.inst(conv).reg_info.clone().unwrap();
    let fma_targets: Vec<Register> = insts
        .iter()
        .filter(|i| i.mnemonic() == Mnemonic::Vfmadd231ps)
        .map(|i| i.op0_register())
        .take(4)
        .collect();
    let expected: Vec<Register> = accumulators
        .iter()
        .map(|&r| Register::YMM0 + r as u32)
        .collect();
    assert_eq!(fma_targets, expected);
}

#[test]
fn test_convolution_needs_three_pointers() {
    let shape = ConvShape {
        kernel_h: 1,
        kernel_w: 1,
        channel_packs: 1,
        row_stride: 0,
        col_stride: 0,
    };
    let mut b = GraphBuilder::new();
    let data = b.parameter();
    let x = b.load(data, 0);
    let conv = b.convolution(shape, x, data, data);
    let st = b.store(Value::new(conv, 0));
    b.result(st);
    let mut graph = b.finish().unwrap();

    assert!(matches!(
        generate(&mut graph, Isa::Avx2),
        Err(CompileError::MalformedGraph { .. })
    ));
}

#[test]
fn test_register_info_stays_on_the_graph() {
    let mut graph = scale_graph();
    generate(&mut graph, Isa::Avx2).unwrap();
    assert_eq!(graph.inst(0).reg_info, Some(vec![0]));
    assert_eq!(graph.inst(4).reg_info, Some(vec![1]));
    assert!(matches!(
        graph.inst(1).kind,
        OpKind::Load {
            post_increment: true,
            ..
        }
    ));
}

#[test]
fn test_outer_loop_can_be_disabled() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let params = CompileParams::new(3, 8).with_scheduler_offset(0, 512);
    let compile = |config: GeneratorConfig| {
        Generator::with_config(X64Backend::new(Isa::Avx2), config)
            .generate(&mut scale_graph(), params, &session)
            .unwrap()
    };
    let with = compile(GeneratorConfig::default());
    let without = compile(GeneratorConfig::default().with_outer_loop(false));
    assert!(with.code_size() > without.code_size());
    assert_eq!(session.stats().kernels_compiled, 2);
}

#[test]
fn test_elf_exports_the_kernel() {
    let kernel = generate(&mut scale_graph(), Isa::Avx2).unwrap();
    let bytes = emit_elf("scale_by_quarter", &kernel).unwrap();
    let file = File::parse(&*bytes).unwrap();
    let symbol = file
        .symbols()
        .find(|s| s.name().ok() == Some("scale_by_quarter"))
        .unwrap();
    assert_eq!(symbol.size(), kernel.code_size() as u64);
    assert!(symbol.is_definition());
}

#[test]
fn test_convolution_scratch_stays_inside_the_bank() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let lower = |bank_size: usize| {
        let (mut graph, conv) = conv_graph();
        let config = GeneratorConfig::default().with_bank_size(bank_size);
        Generator::with_config(X64Backend::new(Isa::Avx2), config)
            .lower(&mut graph, CompileParams::default(), &session)
            .map(|kernel| match &kernel.scheduler.vector.body[conv].0 {
                X64Emitter::Convolution(emitter) => emitter.aux_registers(),
                other => panic!("unexpected emitter {other:?}"),
            })
    };

    // four accumulators plus the first partial sum fill a bank of five
    assert!(matches!(
        lower(4),
        Err(CompileError::RegisterBankExhausted { .. })
    ));
    assert_eq!(
        lower(5).unwrap_err(),
        CompileError::FreeRegisterPoolExhausted { pool: 5 }
    );
    assert_eq!(lower(7).unwrap(), [5, 6]);
    assert!(lower(16).unwrap().iter().all(|&r| r < 16));
}

#[test]
fn test_bank_wider_than_the_target_is_rejected() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let config = GeneratorConfig::default().with_bank_size(32);
    let mut graph = scale_graph();
    let err = Generator::with_config(X64Backend::new(Isa::Avx512), config)
        .generate(&mut graph, CompileParams::default(), &session)
        .unwrap_err();
    assert_eq!(
        err,
        CompileError::UnsupportedBankSize {
            requested: 32,
            available: 16
        }
    );
    assert_eq!(
        err.to_string(),
        "bank of 32 vector registers is unsupported, the target has 16"
    );
}
