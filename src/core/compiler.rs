// This module defines the target-independent compilation driver. The Backend trait is the
// seam between the passes in core and a concrete code generator: it reports whether the
// requested instruction set is usable, how many lanes a full-width tile processes, builds
// the emitter for one instruction of an annotated graph, and emits a finished Kernel into
// machine code. Generator runs the pipeline in a fixed order. It rejects unsupported
// targets before touching the graph, then runs liveness, linear scan, register-info
// propagation and the alias fix-up, picks the post-incrementing loads, lowers the graph
// into the vector tile, clones it into the scalar tail tile with loop and label identities
// shifted past the vector ones, wraps both tiles into a Kernel with the pointer counts and
// compile-time parameters, and hands the Kernel to the backend. Register info stays on the
// caller's graph so it can be inspected after compilation. A configured bank wider than the
// registers the backend can address is rejected up front.

//! Compilation driver.
//!
//! ```text
//! ISA check -> bank check -> liveness -> linear scan -> reg info -> alias fix-up
//!           -> post-increment -> vector tile -> scalar tile -> Kernel
//!           -> backend emission (code, then data)
//! ```

use super::config::GeneratorConfig;
use super::error::{CompileError, CompileResult};
use super::ir::{ControlId, Graph};
use super::labels::SlotState;
use super::post_increment::mark_post_increments;
use super::reg_info::{assign_registers, reg_info_of};
use super::session::CompilationSession;
use super::tile::{CompileParams, Kernel, Tile, TileScheduler, MAX_IO_PORTS};

/// Hooks implemented by a target code generator.
pub trait Backend {
    /// Per-instruction emitter produced for tiles.
    type Emitter;

    /// Target name used in diagnostics.
    fn name(&self) -> String;

    fn is_supported(&self) -> bool;

    /// Elements processed by one iteration of the full-width tile.
    fn lanes(&self) -> usize;

    /// Vector registers the emitters can address.
    fn vector_registers(&self) -> usize;

    /// Build the emitter for instruction `id` of an annotated graph whose
    /// registers all lie below `bank_size`.
    fn create_emitter(
        &self,
        graph: &Graph,
        id: usize,
        bank_size: usize,
    ) -> CompileResult<Self::Emitter>;

    /// Emit the whole kernel: tiles, entry/exit wrapper, then constant data.
    fn emit_kernel(
        &self,
        kernel: &mut Kernel<Self::Emitter>,
        config: &GeneratorConfig,
        session: &CompilationSession<'_>,
    ) -> CompileResult<CompiledKernel>;
}

/// Machine code of one kernel plus the facts needed to call and inspect it.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledKernel {
    /// Code followed by constant data.
    pub code: Vec<u8>,
    pub data_size: usize,
    pub lanes: usize,
    pub num_inputs: usize,
    pub num_outputs: usize,
    /// Final state of every identity in the label table.
    pub labels: Vec<(ControlId, SlotState)>,
}

impl CompiledKernel {
    /// Bytes of executable code, excluding the trailing data.
    pub fn code_size(&self) -> usize {
        self.code.len() - self.data_size
    }
}

/// Architecture-independent compilation driver.
pub struct Generator<B: Backend> {
    backend: B,
    config: GeneratorConfig,
}

impl<B: Backend> Generator<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, GeneratorConfig::default())
    }

    pub fn with_config(backend: B, config: GeneratorConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Annotate `graph` and lower it into a kernel without emitting code.
    pub fn lower(
        &self,
        graph: &mut Graph,
        params: CompileParams,
        session: &CompilationSession<'_>,
    ) -> CompileResult<Kernel<B::Emitter>> {
        if !self.backend.is_supported() {
            return Err(CompileError::UnsupportedIsa {
                isa: self.backend.name(),
            });
        }

        let available = self.backend.vector_registers();
        let requested = self.config.bank_size;
        if requested == 0 || requested > available {
            return Err(CompileError::UnsupportedBankSize {
                requested,
                available,
            });
        }

        let num_inputs = graph.parameters().len();
        let num_outputs = graph.results().len();
        if num_inputs + num_outputs > MAX_IO_PORTS {
            return Err(CompileError::malformed(format!(
                "{} pointers exceed the {MAX_IO_PORTS} kernel ports",
                num_inputs + num_outputs
            )));
        }

        assign_registers(graph, session, &self.config)?;
        let advancing = mark_post_increments(graph);
        log::debug!("{advancing} loads advance their pointer");

        let vector = self.lower_tile(graph, self.backend.lanes(), session)?;
        let scalar_graph = graph.to_scalar(graph.max_control_id().map_or(0, |id| id + 1));
        let scalar = self.lower_tile(&scalar_graph, 1, session)?;
        log::debug!(
            "tiles: vector {} x{} lanes, scalar {} x1",
            vector.len(),
            vector.lanes,
            scalar.len()
        );

        Ok(Kernel {
            scheduler: TileScheduler { vector, scalar },
            num_inputs,
            num_outputs,
            params,
        })
    }

    fn lower_tile(
        &self,
        graph: &Graph,
        lanes: usize,
        session: &CompilationSession<'_>,
    ) -> CompileResult<Tile<B::Emitter>> {
        let mut body = Vec::with_capacity(graph.len());
        for (id, inst) in graph.iter() {
            let emitter = self
                .backend
                .create_emitter(graph, id, self.config.bank_size)?;
            body.push((emitter, reg_info_of(graph, id)?));
            session.record_instruction_lowered(inst.kind.name());
        }
        Ok(Tile::new(lanes, body))
    }

    /// Compile `graph` into machine code, leaving register info on it.
    pub fn generate(
        &self,
        graph: &mut Graph,
        params: CompileParams,
        session: &CompilationSession<'_>,
    ) -> CompileResult<CompiledKernel> {
        let mut kernel = self.lower(graph, params, session)?;
        let compiled = self.backend.emit_kernel(&mut kernel, &self.config, session)?;
        session.record_kernel_compiled(compiled.code.len(), compiled.data_size);
        log::debug!(
            "kernel: {} code bytes, {} data bytes",
            compiled.code_size(),
            compiled.data_size
        );
        Ok(compiled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ir::{GraphBuilder, OpKind};
    use bumpalo::Bump;

    /// Backend that records op names instead of emitting code.
    struct NameBackend {
        supported: bool,
    }

    impl Backend for NameBackend {
        type Emitter = &'static str;

        fn name(&self) -> String {
            "names".to_string()
        }

        fn is_supported(&self) -> bool {
            self.supported
        }

        fn lanes(&self) -> usize {
            4
        }

        fn vector_registers(&self) -> usize {
            16
        }

        fn create_emitter(
            &self,
            graph: &Graph,
            id: usize,
            _bank_size: usize,
        ) -> CompileResult<&'static str> {
            Ok(graph.inst(id).kind.name())
        }

        fn emit_kernel(
            &self,
            kernel: &mut Kernel<&'static str>,
            _config: &GeneratorConfig,
            _session: &CompilationSession<'_>,
        ) -> CompileResult<CompiledKernel> {
            let code = kernel
                .scheduler
                .vector
                .body
                .iter()
                .chain(&kernel.scheduler.scalar.body)
                .flat_map(|(name, _)| name.bytes())
                .collect();
            Ok(CompiledKernel {
                code,
                data_size: 0,
                lanes: kernel.scheduler.vector.lanes,
                num_inputs: kernel.num_inputs,
                num_outputs: kernel.num_outputs,
                labels: Vec::new(),
            })
        }
    }

    fn copy_graph() -> Graph {
        let mut b = GraphBuilder::new();
        let p = b.parameter();
        let l = b.load(p, 0);
        let st = b.store(l);
        b.result(st);
        b.finish().unwrap()
    }

    #[test]
    fn test_unsupported_target_fails_before_allocation() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let generator = Generator::new(NameBackend { supported: false });
        let mut graph = copy_graph();

        let err = generator
            .generate(&mut graph, CompileParams::default(), &session)
            .unwrap_err();
        assert_eq!(
            err,
            CompileError::UnsupportedIsa {
                isa: "names".to_string()
            }
        );
        assert!(graph.iter().all(|(_, inst)| inst.reg_info.is_none()));
        assert_eq!(session.stats().instructions_lowered, 0);
    }

    #[test]
    fn test_lowering_builds_both_tiles() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let generator = Generator::new(NameBackend { supported: true });
        let mut graph = copy_graph();

        let kernel = generator
            .lower(&mut graph, CompileParams::default(), &session)
            .unwrap();
        let names = |tile: &Tile<&'static str>| {
            tile.body.iter().map(|(n, _)| *n).collect::<Vec<_>>()
        };
        assert_eq!(kernel.scheduler.vector.lanes, 4);
        assert_eq!(kernel.scheduler.scalar.lanes, 1);
        assert_eq!(
            names(&kernel.scheduler.vector),
            vec!["parameter", "load", "store", "result"]
        );
        assert_eq!(
            names(&kernel.scheduler.scalar),
            vec!["parameter", "scalar_load", "scalar_store", "result"]
        );
        assert_eq!((kernel.num_inputs, kernel.num_outputs), (1, 1));
        assert_eq!(kernel.scheduler.vector.body[2].1.outputs, vec![1]);
        assert!(matches!(
            graph.inst(1).kind,
            OpKind::Load {
                post_increment: true,
                ..
            }
        ));
        assert_eq!(session.stats().instructions_lowered, 8);
    }

    #[test]
    fn test_too_many_pointers_are_rejected() {
        let mut b = GraphBuilder::new();
        for _ in 0..MAX_IO_PORTS + 1 {
            let p = b.parameter();
            let l = b.load(p, 0);
            let st = b.store(l);
            b.result(st);
        }
        let mut graph = b.finish().unwrap();

        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let generator = Generator::new(NameBackend { supported: true });
        let err = generator
            .generate(&mut graph, CompileParams::default(), &session)
            .unwrap_err();
        assert!(matches!(err, CompileError::MalformedGraph { .. }));
    }

    #[test]
    fn test_bank_size_must_fit_the_target() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        for (bank_size, available) in [(0, 16), (17, 16), (256, 16)] {
            let generator = Generator::with_config(
                NameBackend { supported: true },
                GeneratorConfig::default().with_bank_size(bank_size),
            );
            let mut graph = copy_graph();
            let err = generator
                .lower(&mut graph, CompileParams::default(), &session)
                .unwrap_err();
            assert_eq!(
                err,
                CompileError::UnsupportedBankSize {
                    requested: bank_size,
                    available
                }
            );
            assert!(graph.iter().all(|(_, inst)| inst.reg_info.is_none()));
        }

        let generator = Generator::with_config(
            NameBackend { supported: true },
            GeneratorConfig::default().with_bank_size(2),
        );
        assert!(generator
            .lower(&mut copy_graph(), CompileParams::default(), &session)
            .is_ok());
    }
}
