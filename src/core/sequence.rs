//! Sequence tracking for generation requests.
//!
//! A sequence is the per-request runtime record: token history, assigned
//! blocks, scheduling state, and the LoRA adapter bound to it (if any).
//! Only the scheduler mutates a sequence between steps; the execution
//! layer appends tokens through the scheduler once a step completes.

use crate::config::SamplingParams;
use crate::core::block::BlockTable;
use crate::error::{Error, Result};
use crate::lora::LoraRequest;

/// Unique identifier for a sequence.
pub type SequenceId = u64;

/// Status of a sequence in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceStatus {
    /// Waiting in the admission queue.
    Waiting,
    /// Currently running (prefill or decode).
    Running,
    /// Evicted under block pressure; re-enters the queue with its
    /// generated history intact.
    Preempted,
    /// Finished generation (EOS, stop string, or token limit).
    Finished,
    /// Cancelled by the caller or failed with a capacity error.
    Aborted,
}

impl SequenceStatus {
    /// Whether the sequence still holds or may acquire resources.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Waiting | Self::Running | Self::Preempted)
    }

    /// Whether the sequence reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Aborted)
    }

    /// Get the status name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Preempted => "Preempted",
            Self::Finished => "Finished",
            Self::Aborted => "Aborted",
        }
    }
}

/// Reason a sequence reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// End-of-sequence token generated.
    EndOfSequence,
    /// Maximum token limit reached.
    MaxTokens,
    /// Stop string encountered; output is truncated at the match.
    StopSequence,
    /// Aborted by the caller.
    Aborted,
    /// Failed because the cache can never make room for the request.
    OutOfCapacity,
}

/// A single generation request's runtime state.
///
/// The bound adapter is fixed at construction and immutable for the
/// sequence's lifetime; there is deliberately no setter.
#[derive(Debug, Clone)]
pub struct Sequence {
    /// Unique sequence identifier.
    seq_id: SequenceId,
    /// Prompt token IDs.
    prompt_token_ids: Vec<u32>,
    /// Generated output token IDs (append-only).
    output_token_ids: Vec<u32>,
    /// Block table mapping logical positions to physical blocks.
    block_table: BlockTable,
    /// Tokens whose KV entries are present in the cache. Reset to zero
    /// on preemption since the blocks are freed.
    num_computed_tokens: usize,
    /// Current status.
    status: SequenceStatus,
    /// LoRA adapter bound to this sequence, if any. `None` = base model.
    lora: Option<LoraRequest>,
    /// Sampling parameters; broadcast with the batch plan.
    sampling: SamplingParams,
    /// Admission order stamp, assigned by the scheduler.
    arrival: u64,
    /// Step at which this sequence last appeared in a batch plan.
    last_scheduled_step: u64,
    /// Times this sequence has been preempted.
    preemptions: u32,
    /// Reason for reaching a terminal state.
    finish_reason: Option<FinishReason>,
    /// Whether this sequence currently holds a reference on its adapter
    /// slot. Managed by the scheduler.
    pub(crate) holds_adapter_ref: bool,
}

impl Sequence {
    /// Create a new sequence over the given prompt.
    pub fn new(
        seq_id: SequenceId,
        prompt_token_ids: Vec<u32>,
        sampling: SamplingParams,
        block_size: usize,
    ) -> Self {
        Self {
            seq_id,
            prompt_token_ids,
            output_token_ids: Vec::new(),
            block_table: BlockTable::new(block_size),
            num_computed_tokens: 0,
            status: SequenceStatus::Waiting,
            lora: None,
            sampling,
            arrival: 0,
            last_scheduled_step: 0,
            preemptions: 0,
            finish_reason: None,
            holds_adapter_ref: false,
        }
    }

    /// Bind a LoRA adapter. The binding is immutable afterwards.
    pub fn with_lora(mut self, lora: LoraRequest) -> Self {
        self.lora = Some(lora);
        self
    }

    /// Fork this sequence for parallel sampling.
    ///
    /// The child shares the parent's token history and block table; the
    /// caller must bump reference counts through
    /// [`BlockStore::fork`](crate::core::block_store::BlockStore::fork).
    pub fn fork(&self, child_id: SequenceId) -> Self {
        let mut child = self.clone();
        child.seq_id = child_id;
        child.holds_adapter_ref = false;
        child
    }

    // ========== Getters ==========

    /// Get the sequence ID.
    pub fn seq_id(&self) -> SequenceId {
        self.seq_id
    }

    /// Get the prompt token IDs.
    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.prompt_token_ids
    }

    /// Get the output token IDs.
    pub fn output_token_ids(&self) -> &[u32] {
        &self.output_token_ids
    }

    /// Get all token IDs (prompt + output).
    pub fn all_token_ids(&self) -> Vec<u32> {
        let mut tokens = self.prompt_token_ids.clone();
        tokens.extend(&self.output_token_ids);
        tokens
    }

    /// Get the last token ID (output, falling back to the prompt).
    pub fn last_token_id(&self) -> Option<u32> {
        self.output_token_ids
            .last()
            .copied()
            .or_else(|| self.prompt_token_ids.last().copied())
    }

    /// Get the block table.
    pub fn block_table(&self) -> &BlockTable {
        &self.block_table
    }

    pub(crate) fn block_table_mut(&mut self) -> &mut BlockTable {
        &mut self.block_table
    }

    /// Get the current status.
    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    /// Get the bound LoRA request, if any.
    pub fn lora(&self) -> Option<&LoraRequest> {
        self.lora.as_ref()
    }

    /// Get the adapter ID alias, if an adapter is bound.
    pub fn adapter_id(&self) -> Option<u32> {
        self.lora.as_ref().map(|l| l.id)
    }

    /// Get the sampling parameters.
    pub fn sampling(&self) -> &SamplingParams {
        &self.sampling
    }

    /// Get the finish reason (if terminal).
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Admission order stamp.
    pub fn arrival(&self) -> u64 {
        self.arrival
    }

    pub(crate) fn set_arrival(&mut self, arrival: u64) {
        self.arrival = arrival;
    }

    /// Step at which this sequence was last scheduled.
    pub fn last_scheduled_step(&self) -> u64 {
        self.last_scheduled_step
    }

    pub(crate) fn set_last_scheduled_step(&mut self, step: u64) {
        self.last_scheduled_step = step;
    }

    /// Times this sequence has been preempted so far.
    pub fn preemptions(&self) -> u32 {
        self.preemptions
    }

    // ========== Length queries ==========

    /// Get the prompt length.
    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    /// Get the output length.
    pub fn output_len(&self) -> usize {
        self.output_token_ids.len()
    }

    /// Get the total length (prompt + output).
    pub fn total_len(&self) -> usize {
        self.prompt_len() + self.output_len()
    }

    /// Tokens whose KV entries are currently cached.
    pub fn num_computed_tokens(&self) -> usize {
        self.num_computed_tokens
    }

    pub(crate) fn advance_computed(&mut self, num_tokens: usize) {
        self.num_computed_tokens += num_tokens;
    }

    /// Whether the next step for this sequence is a decode step.
    pub fn is_prefill_complete(&self) -> bool {
        // Everything but the newest token is cached once prefill ran.
        self.num_computed_tokens >= self.prompt_len()
    }

    // ========== Token operations ==========

    /// Append a generated token.
    pub fn append_token(&mut self, token_id: u32) {
        self.output_token_ids.push(token_id);
    }

    // ========== State transitions ==========

    /// Transition to running (admission or re-admission).
    pub fn set_running(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Waiting | SequenceStatus::Preempted => {
                self.status = SequenceStatus::Running;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Running",
            }),
        }
    }

    /// Transition to preempted: blocks are gone, history is kept, the
    /// sequence will re-run its prefill over prompt + generated tokens.
    pub fn set_preempted(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Running => {
                self.status = SequenceStatus::Preempted;
                self.num_computed_tokens = 0;
                self.preemptions += 1;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Preempted",
            }),
        }
    }

    /// Mark the sequence as finished.
    pub fn set_finished(&mut self, reason: FinishReason) {
        self.status = SequenceStatus::Finished;
        self.finish_reason = Some(reason);
    }

    /// Mark the sequence as aborted.
    pub fn set_aborted(&mut self, reason: FinishReason) {
        self.status = SequenceStatus::Aborted;
        self.finish_reason = Some(reason);
    }
}

impl PartialEq for Sequence {
    fn eq(&self, other: &Self) -> bool {
        self.seq_id == other.seq_id
    }
}

impl Eq for Sequence {}
