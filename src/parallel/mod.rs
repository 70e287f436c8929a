//! Tensor-parallel coordination.

pub mod coordinator;

pub use coordinator::TensorParallelGroup;
