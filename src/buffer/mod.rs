//! # Buffering
//!
//! [`BatchBuffer`] turns many single writes into few bulk writes with a
//! per-item completion handle; [`QueueItemWriter`] applies it to ready-queue
//! inserts.

pub mod batch_buffer;
pub mod queue_item_writer;

pub use batch_buffer::{
    BatchBuffer, BatchBufferOptions, BufferDebugSnapshot, BufferLifecycle, BufferShutdown,
    FlushFn, FlushHandle, InFlightFlush, SizeFn,
};
pub use queue_item_writer::QueueItemWriter;
