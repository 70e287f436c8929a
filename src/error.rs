//! Error types for vellum.

use thiserror::Error;

/// Result type alias for vellum operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for vellum.
///
/// Recoverable conditions (`OutOfMemory`, `AdapterNotFound`) are expressed
/// as variants and handled by the scheduler or surfaced per request.
/// Allocator invariant violations (refcount underflow, double free) are
/// programming bugs and panic instead of appearing here.
#[derive(Error, Debug)]
pub enum Error {
    /// Block allocation failed - the free pool cannot satisfy the request.
    #[error("out of KV cache blocks: requested {requested}, free {free}")]
    OutOfMemory { requested: usize, free: usize },

    /// A LoRA adapter's weights could not be found at the given path.
    #[error("LoRA adapter not found: {0}")]
    AdapterNotFound(String),

    /// A tensor-parallel rank reported a view of the step that differs
    /// from the driver's. Fatal: cache state is no longer trustworthy.
    #[error("rank {rank} desynchronized at step {step}: {detail}")]
    RankDesynchronization {
        rank: usize,
        step: u64,
        detail: String,
    },

    /// The engine hit a fatal error earlier and refuses further work.
    #[error("engine is poisoned and can no longer serve requests")]
    EnginePoisoned,

    /// Sequence not found in the registry.
    #[error("sequence {0} not found")]
    SequenceNotFound(u64),

    /// Invalid sequence state transition.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Model executor error.
    #[error("model executor error: {0}")]
    Executor(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
