//! LoRA adapter multiplexing.
//!
//! Adapters are small low-rank weight deltas layered over the shared
//! base model. This module tracks which adapters are resident on the
//! GPU ([`AdapterSlotManager`]) and the caller-facing request type
//! ([`LoraRequest`]).

pub mod request;
pub mod slots;

pub use request::{AdapterId, LoraRequest};
pub use slots::AdapterSlotManager;
