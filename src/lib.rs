#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Tasker Scheduler
//!
//! Tenant-scoped scheduling core for step runs.
//!
//! ## Overview
//!
//! A queue controller serves one partition of tenants. For every tenant it
//! runs a small set of background operations, each at most once at a time:
//!
//! - **Assignment**: claim queued step runs and assign them to workers with
//!   free slots, honouring priority, action matching and sticky placement.
//! - **Update cascade**: apply buffered step run state changes, enqueue the
//!   children that became startable, and report finished workflow runs.
//! - **Timeout and retry reaping**: fail step runs past their deadline and
//!   requeue retries whose backoff has elapsed.
//! - **Cleanup**: delete processed queue rows.
//!
//! Writes that happen once per step run go through [`buffer::BatchBuffer`],
//! which coalesces them into bulk writes behind a bounded admission ceiling.
//!
//! ## Module Organization
//!
//! - [`scheduler`] - Per-tenant single-flight operation pools
//! - [`queue`] - Assignment, update, timeout, retry and cleanup operations plus the controller driver
//! - [`buffer`] - Bounded write batching
//! - [`storage`] - Storage engine trait with in-memory and PostgreSQL engines
//! - [`messaging`] - Message envelope, queue routing and transports
//! - [`worker`] - Worker-side action registry and runtime
//! - [`config`] - Configuration management
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tasker_scheduler::config::SchedulerConfig;
//! use tasker_scheduler::messaging::InMemoryMessageQueue;
//! use tasker_scheduler::queue::QueueController;
//! use tasker_scheduler::storage::InMemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let controller = QueueController::new(
//!     Arc::new(InMemoryStorage::new()),
//!     Arc::new(InMemoryMessageQueue::new()),
//!     &SchedulerConfig::default(),
//! )?;
//!
//! let handle = controller.start().await?;
//! // ...
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests (in-memory backends)
//! ```

pub mod buffer;
pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod queue;
pub mod scheduler;
pub mod storage;
pub mod worker;

pub use buffer::{BatchBuffer, BatchBufferOptions, BufferDebugSnapshot, QueueItemWriter};
pub use config::{ConfigLoader, SchedulerConfig};
pub use constants::{FailureReason, StepRunStatus, WorkflowRunStatus};
pub use error::{ErrorAggregator, SchedulerError, SchedulerResult};
pub use messaging::{MessageQueue, QueueMessage, QueueType};
pub use queue::{
    QueueAssignmentEngine, QueueCleaner, QueueController, RetryReaper, TimeoutReaper,
    UpdateCascadeProcessor, UpdateStrategy,
};
pub use scheduler::{make_batched, OperationPool};
pub use storage::StorageEngine;
pub use worker::{ActionRegistry, WorkerRuntime};
