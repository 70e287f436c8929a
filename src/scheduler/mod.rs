//! Request scheduling for continuous batching.

pub mod batch;

pub use batch::{BatchPlan, ScheduledSequence, Scheduler};
