//! Compile a text IR graph into an x86-64 kernel.
//!
//! Prints the register assignment of every instruction and the kernel size,
//! and optionally writes the kernel into an ELF object file.

use bumpalo::Bump;
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use tilejit::core::reg_info::reg_info_of;
use tilejit::core::{parse_graph, CompilationSession, CompileParams, Generator, GeneratorConfig};
use tilejit::x64::{emit_elf, Isa, X64Backend};

#[derive(Parser, Debug)]
#[command(name = "tilejit", about = "Compile a tile graph into an x86-64 vector kernel")]
struct Args {
    /// Text IR file; `-` reads stdin.
    file: PathBuf,

    /// Target instruction set: avx2, avx512 or host.
    #[arg(long, default_value = "host")]
    isa: Isa,

    /// Vector registers available to the allocator.
    #[arg(long, default_value_t = tilejit::core::DEFAULT_BANK_SIZE)]
    bank_size: usize,

    /// Inner work amount, in elements.
    #[arg(long, default_value_t = 1)]
    inner: i64,

    /// Outer work amount.
    #[arg(long, default_value_t = 1)]
    outer: i64,

    /// Print the registers of every instruction.
    #[arg(long)]
    dump_regs: bool,

    /// Write the kernel into an ELF relocatable object.
    #[arg(long)]
    emit_obj: Option<PathBuf>,

    /// Symbol name of the kernel in the object file.
    #[arg(long, default_value = "tile_kernel")]
    symbol: String,
}

fn read_source(path: &PathBuf) -> std::io::Result<String> {
    if path.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin())
    } else {
        fs::read_to_string(path)
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let source = read_source(&args.file)?;
    let mut graph = parse_graph(&source)?;

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let config = GeneratorConfig::default().with_bank_size(args.bank_size);
    let generator = Generator::with_config(X64Backend::new(args.isa), config);
    let kernel = generator.generate(
        &mut graph,
        CompileParams::new(args.outer, args.inner),
        &session,
    )?;

    if args.dump_regs {
        for (id, inst) in graph.iter() {
            let regs = reg_info_of(&graph, id)?;
            println!(
                "{id:>4} {:<14} in {:?} out {:?}",
                inst.kind.name(),
                regs.inputs,
                regs.outputs
            );
        }
    }

    println!(
        "{}: {} code bytes, {} data bytes, {} lanes",
        args.isa,
        kernel.code_size(),
        kernel.data_size,
        kernel.lanes
    );
    println!("{}", session.stats());

    if let Some(path) = &args.emit_obj {
        fs::write(path, emit_elf(&args.symbol, &kernel)?)?;
        println!("wrote {}", path.display());
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
