//! # Tenant Operation Scheduling
//!
//! Single-flight, coalescing per-tenant execution of the queue controller's
//! operations, and the batch fan-out helper they share.

pub mod batching;
pub mod operation_pool;

pub use batching::make_batched;
pub use operation_pool::{operation_fn, OperationFn, OperationPool, SerialOperation};
