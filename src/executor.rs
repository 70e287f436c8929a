//! Narrow interfaces to the excluded collaborators.
//!
//! The transformer forward pass, the weight loader, and the tokenizer
//! live outside this crate; the engine consumes them only through the
//! traits defined here. Every tensor-parallel rank owns its own
//! [`ModelExecutor`] replica and receives the exact same batch plan.

use std::path::Path;

use crate::core::sequence::SequenceId;
use crate::error::Result;
use crate::scheduler::BatchPlan;

/// GPU memory measurements from the warmup forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryProfile {
    /// Total device memory in bytes.
    pub total_gpu_bytes: u64,
    /// Free device memory after a maximum-size forward pass.
    pub free_gpu_bytes: u64,
    /// Bytes one KV cache block occupies across all layers.
    pub kv_block_bytes: u64,
    /// Footprint to reserve per resident LoRA adapter.
    pub per_adapter_bytes: u64,
}

/// Opaque handle to loaded weights (base model or adapter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightsHandle {
    /// Loader-assigned identifier.
    pub id: u64,
    /// Device memory footprint in bytes.
    pub bytes: u64,
}

/// Next-token logits for one scheduled sequence.
#[derive(Debug, Clone)]
pub struct SequenceLogits {
    /// The sequence these logits belong to.
    pub seq_id: SequenceId,
    /// Raw logits over the vocabulary.
    pub logits: Vec<f32>,
}

/// One rank's replica of the model execution backend.
///
/// Implementations must be deterministic: two replicas given identical
/// plans must produce bit-identical logits, since the coordinator
/// verifies cross-rank agreement with digests.
pub trait ModelExecutor: Send {
    /// Run one maximum-size dry forward pass and report memory headroom.
    /// Called exactly once per rank, before serving starts.
    fn profile_memory(&mut self, max_num_seqs: usize) -> Result<MemoryProfile>;

    /// Execute one step: write KV entries into the assigned block slots
    /// and return next-token logits for every scheduled sequence, in
    /// plan order (prefill group first, then decode group).
    fn forward(&mut self, plan: &BatchPlan) -> Result<Vec<SequenceLogits>>;
}

/// Loader for base-model and adapter weights.
pub trait WeightLoader {
    /// Load the shared base-model weights.
    fn load_base_model(&self) -> Result<WeightsHandle>;

    /// Load a LoRA adapter's weight deltas.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdapterNotFound`](crate::Error::AdapterNotFound)
    /// if no adapter exists at `path`.
    fn load_adapter(&self, path: &Path) -> Result<WeightsHandle>;

    /// Cheap existence probe, used to reject bad requests before they
    /// reach the scheduler.
    fn adapter_exists(&self, path: &Path) -> bool;
}

/// Text <-> token-id conversion.
pub trait Tokenizer {
    /// Encode text into token IDs.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token IDs back into text.
    fn decode(&self, token_ids: &[u32]) -> Result<String>;

    /// The end-of-sequence token ID.
    fn eos_token_id(&self) -> u32;
}
