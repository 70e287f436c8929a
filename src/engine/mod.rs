//! The serving engine and its sampler.

pub mod llm;
pub mod sampler;

pub use llm::{CompletionOutput, GenerationOutput, GenerationRequest, LlmEngine};
pub use sampler::Sampler;
