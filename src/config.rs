//! Configuration types for vellum.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Engine configuration.
///
/// Immutable after engine construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of sequences to process concurrently.
    pub max_num_seqs: usize,
    /// Maximum number of prompt tokens to prefill per iteration.
    pub max_prefill_tokens: usize,
    /// Block size for the paged KV cache (tokens per block).
    pub block_size: usize,
    /// Enable LoRA adapter multiplexing.
    pub enable_lora: bool,
    /// Maximum number of LoRA adapters resident on the GPU at once.
    pub max_loras: usize,
    /// Number of tensor-parallel ranks.
    pub tensor_parallel_size: usize,
    /// Fraction of blocks kept free to absorb fragmentation.
    pub watermark: f32,
    /// Fraction of measured free GPU memory handed to the block pool.
    pub gpu_memory_utilization: f32,
    /// Consecutive empty scheduling steps tolerated while requests wait
    /// before the head request is failed with a capacity error.
    pub max_idle_steps: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_num_seqs: 256,
            max_prefill_tokens: 4096,
            block_size: 16,
            enable_lora: false,
            max_loras: 4,
            tensor_parallel_size: 1,
            watermark: 0.01,
            gpu_memory_utilization: 0.9,
            max_idle_steps: 32,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check configuration consistency.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for zero-sized budgets or out-of-range
    /// fractions.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::Config("block_size must be > 0".into()));
        }
        if self.max_num_seqs == 0 {
            return Err(Error::Config("max_num_seqs must be > 0".into()));
        }
        if self.tensor_parallel_size == 0 {
            return Err(Error::Config("tensor_parallel_size must be > 0".into()));
        }
        if self.enable_lora && self.max_loras == 0 {
            return Err(Error::Config(
                "max_loras must be > 0 when enable_lora is set".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.watermark) {
            return Err(Error::Config("watermark must be in [0, 1)".into()));
        }
        if !(0.0..=1.0).contains(&self.gpu_memory_utilization)
            || self.gpu_memory_utilization == 0.0
        {
            return Err(Error::Config(
                "gpu_memory_utilization must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Scheduler configuration, derived from [`EngineConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of sequences resident in the running set.
    pub max_num_seqs: usize,
    /// Maximum prompt tokens admitted for prefill per iteration.
    pub max_prefill_tokens: usize,
    /// Consecutive empty steps before the head request is failed.
    pub max_idle_steps: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_seqs: 256,
            max_prefill_tokens: 4096,
            max_idle_steps: 32,
        }
    }
}

impl From<&EngineConfig> for SchedulerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_num_seqs: config.max_num_seqs,
            max_prefill_tokens: config.max_prefill_tokens,
            max_idle_steps: config.max_idle_steps,
        }
    }
}

/// Per-request sampling parameters.
///
/// Every recognized field is enumerated here with an explicit default;
/// the struct travels inside the batch plan so that all tensor-parallel
/// ranks observe identical sampling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Maximum tokens to generate.
    pub max_tokens: usize,
    /// Stop strings; generation halts and output is truncated at the
    /// first occurrence.
    pub stop: Vec<String>,
    /// Number of parallel samples per prompt (prefix blocks are shared).
    pub n: usize,
    /// Seed for the per-sequence sampling RNG.
    pub seed: u64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            max_tokens: 256,
            stop: Vec::new(),
            n: 1,
            seed: 0,
        }
    }
}

impl SamplingParams {
    /// Greedy decoding parameters (temperature 0).
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Self::default()
        }
    }
}

/// Sizing of the paged KV cache, derived once by the capacity profiler.
///
/// Read-only after warmup; exposed for capacity verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    num_gpu_blocks: usize,
    block_size: usize,
}

impl CacheConfig {
    pub(crate) fn new(num_gpu_blocks: usize, block_size: usize) -> Self {
        Self {
            num_gpu_blocks,
            block_size,
        }
    }

    /// Total number of GPU blocks in the pool.
    pub fn num_gpu_blocks(&self) -> usize {
        self.num_gpu_blocks
    }

    /// Tokens per block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }
}
