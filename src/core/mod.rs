//! Core infrastructure for vellum.
//!
//! This module contains the fundamental building blocks:
//! - Block and BlockTable for the paged KV cache
//! - BlockStore for page allocation, sharing, and the capacity profiler
//! - Sequence for request tracking

pub mod block;
pub mod block_store;
pub mod sequence;
