//! # vellum
//!
//! Resource management core for a continuous-batching LLM inference
//! server: a paged KV cache with copy-on-write prefix sharing, a
//! first-come first-served scheduler with preemption by recomputation,
//! bounded LoRA adapter multiplexing, and lock-step tensor-parallel
//! coordination with divergence detection.
//!
//! The transformer itself stays outside the crate: the engine drives
//! any backend implementing [`ModelExecutor`], plus a [`Tokenizer`]
//! and a [`WeightLoader`].
//!
//! ## Architecture
//!
//! ```text
//!  add_request -> [Scheduler] --BatchPlan--> [TensorParallelGroup]
//!                  |      |                    |  rank 0..N-1, each a
//!                  |      +-- [BlockStore]     |  ModelExecutor replica
//!                  |      +-- [AdapterSlotManager]
//!                  v                           v
//!              waiting queue              logits -> [Sampler] -> tokens
//! ```
//!
//! One call to [`LlmEngine::step`] runs one generation step end to end;
//! [`LlmEngine::generate`] loops steps until a batch of requests has
//! finished. Capacity failures are reported per request through
//! [`FinishReason::OutOfCapacity`], never as engine errors.

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod executor;
pub mod lora;
pub mod parallel;
pub mod scheduler;

pub use config::{CacheConfig, EngineConfig, SamplingParams, SchedulerConfig};
pub use core::block::{Block, BlockId, BlockTable};
pub use core::block_store::{profile_cache_config, BlockStore};
pub use core::sequence::{FinishReason, Sequence, SequenceId, SequenceStatus};
pub use engine::{CompletionOutput, GenerationOutput, GenerationRequest, LlmEngine, Sampler};
pub use error::{Error, Result};
pub use executor::{
    MemoryProfile, ModelExecutor, SequenceLogits, Tokenizer, WeightLoader, WeightsHandle,
};
pub use lora::{AdapterId, AdapterSlotManager, LoraRequest};
pub use parallel::TensorParallelGroup;
pub use scheduler::{BatchPlan, ScheduledSequence, Scheduler};
