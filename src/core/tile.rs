//! Tiles, the tile scheduler and the kernel unit handed to a backend.
//!
//! A [`Tile`] is one data-parallel pass over the instruction list: every
//! instruction paired with its emitter and registers, plus the number of lanes
//! the pass consumes. The [`TileScheduler`] groups the full-width tile with the
//! single-lane tail tile, and a [`Kernel`] adds the pointer counts and the
//! compile-time parameters shared with the runtime.

pub use super::reg_info::RegInfo;

/// Input plus output pointers a kernel may take.
pub const MAX_IO_PORTS: usize = 12;

/// Harness dimensions whose indices shift the pointers at entry.
pub const MAX_HARNESS_DIMS: usize = 5;

/// Scheduler dimensions: outer work amount and inner work amount.
pub const MAX_TILE_RANK: usize = 2;

/// Compile-time parameters shared with the runtime.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileParams {
    /// `[outer work amount, inner work amount]`
    pub scheduler_dims: [i64; MAX_TILE_RANK],
    /// Bytes added to each pointer after every outer iteration.
    pub scheduler_offsets: [i64; MAX_IO_PORTS],
    /// `data_offsets[port * MAX_HARNESS_DIMS + dim]` bytes per unit of `indexes[dim]`.
    pub data_offsets: [i64; MAX_IO_PORTS * MAX_HARNESS_DIMS],
    pub harness_dims: u64,
}

impl Default for CompileParams {
    fn default() -> Self {
        Self {
            scheduler_dims: [1, 1],
            scheduler_offsets: [0; MAX_IO_PORTS],
            data_offsets: [0; MAX_IO_PORTS * MAX_HARNESS_DIMS],
            harness_dims: 0,
        }
    }
}

impl CompileParams {
    pub fn new(outer: i64, inner: i64) -> Self {
        Self {
            scheduler_dims: [outer, inner],
            ..Self::default()
        }
    }

    pub fn with_scheduler_offset(mut self, port: usize, bytes: i64) -> Self {
        self.scheduler_offsets[port] = bytes;
        self
    }

    pub fn with_data_offset(mut self, port: usize, dim: usize, bytes: i64) -> Self {
        self.data_offsets[port * MAX_HARNESS_DIMS + dim] = bytes;
        self.harness_dims = self.harness_dims.max(dim as u64 + 1);
        self
    }

    pub fn data_offset(&self, port: usize, dim: usize) -> i64 {
        self.data_offsets[port * MAX_HARNESS_DIMS + dim]
    }

    pub fn outer_work(&self) -> i64 {
        self.scheduler_dims[0]
    }

    pub fn inner_work(&self) -> i64 {
        self.scheduler_dims[1]
    }
}

/// Pointer arguments of one kernel call.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CallArgs {
    pub src_ptrs: [*const u8; MAX_IO_PORTS],
    pub dst_ptrs: [*mut u8; MAX_IO_PORTS],
}

impl Default for CallArgs {
    fn default() -> Self {
        Self {
            src_ptrs: [std::ptr::null(); MAX_IO_PORTS],
            dst_ptrs: [std::ptr::null_mut(); MAX_IO_PORTS],
        }
    }
}

/// Signature of a compiled kernel once mapped executable.
pub type KernelFn = unsafe extern "C" fn(indexes: *const i64, args: *const CallArgs);

/// One pass over the instruction list.
#[derive(Debug, Clone)]
pub struct Tile<E> {
    pub lanes: usize,
    pub body: Vec<(E, RegInfo)>,
}

impl<E> Tile<E> {
    pub fn new(lanes: usize, body: Vec<(E, RegInfo)>) -> Self {
        Self { lanes, body }
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// Full-width tile followed by the single-lane tail tile.
#[derive(Debug, Clone)]
pub struct TileScheduler<E> {
    pub vector: Tile<E>,
    pub scalar: Tile<E>,
}

/// Top-level compiled unit.
#[derive(Debug, Clone)]
pub struct Kernel<E> {
    pub scheduler: TileScheduler<E>,
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub params: CompileParams,
}

impl<E> Kernel<E> {
    pub fn num_pointers(&self) -> usize {
        self.num_inputs + self.num_outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_layout_is_c_compatible() {
        assert_eq!(
            std::mem::size_of::<CompileParams>(),
            8 * (MAX_TILE_RANK + MAX_IO_PORTS + MAX_IO_PORTS * MAX_HARNESS_DIMS + 1)
        );
        assert_eq!(
            std::mem::size_of::<CallArgs>(),
            2 * MAX_IO_PORTS * std::mem::size_of::<*const u8>()
        );
    }

    #[test]
    fn test_data_offsets_are_indexed_by_port_and_dim() {
        let params = CompileParams::new(4, 100)
            .with_data_offset(2, 1, 256)
            .with_scheduler_offset(0, 64);
        assert_eq!(params.data_offset(2, 1), 256);
        assert_eq!(params.data_offsets[2 * MAX_HARNESS_DIMS + 1], 256);
        assert_eq!(params.harness_dims, 2);
        assert_eq!(params.outer_work(), 4);
        assert_eq!(params.inner_work(), 100);
    }
}
