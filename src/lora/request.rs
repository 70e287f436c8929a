//! Caller-facing LoRA adapter request.

use std::path::PathBuf;

/// Caller-facing alias for an adapter. Adapter identity is keyed by
/// path; two IDs pointing at the same path share one resident slot.
pub type AdapterId = u32;

/// A request to run a sequence with a LoRA adapter applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoraRequest {
    /// Human-readable adapter name.
    pub name: String,
    /// Caller-facing integer alias. Must be non-zero; zero means "base
    /// model only" at the engine boundary and is expressed as the
    /// absence of a request.
    pub id: AdapterId,
    /// Filesystem path to the adapter weights.
    pub path: PathBuf,
}

impl LoraRequest {
    /// Create a new adapter request.
    pub fn new(name: impl Into<String>, id: AdapterId, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            id,
            path: path.into(),
        }
    }
}
