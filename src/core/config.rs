//! Generator configuration.

/// Number of vector registers available to the allocator on every supported target.
pub const DEFAULT_BANK_SIZE: usize = 16;

/// Knobs for one [`Generator`](super::compiler::Generator) instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorConfig {
    /// Capacity of the vector register bank used by linear scan.
    pub bank_size: usize,
    /// Emit the outer scheduler loop over `scheduler_dims[0]`.
    pub outer_loop: bool,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            bank_size: DEFAULT_BANK_SIZE,
            outer_loop: true,
        }
    }
}

impl GeneratorConfig {
    pub fn with_bank_size(mut self, bank_size: usize) -> Self {
        self.bank_size = bank_size;
        self
    }

    pub fn with_outer_loop(mut self, enabled: bool) -> Self {
        self.outer_loop = enabled;
        self
    }
}
