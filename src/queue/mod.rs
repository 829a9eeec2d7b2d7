//! # Queue Controller
//!
//! The per-tenant operations of the scheduling core and the controller that
//! drives them.
//!
//! | Operation | Component | Pool |
//! |---|---|---|
//! | claim and assign queue entries | [`QueueAssignmentEngine`] | "check tenant queue" |
//! | apply step run updates (legacy) | [`UpdateCascadeProcessor`] with [`UpdateStrategy::V1`] | "update step runs" |
//! | apply step run updates (v2) | [`UpdateCascadeProcessor`] with [`UpdateStrategy::V2`] | "update step runs (v2)" |
//! | reap expired timeouts | [`TimeoutReaper`] | "timeout step runs" |
//! | reap elapsed retries | [`RetryReaper`] | "retry step runs" |
//! | delete processed rows | [`QueueCleaner`] | "cleanup queue items" |
//!
//! Every operation returns whether the tenant should be processed again
//! immediately; [`QueueController`] binds each one to an
//! [`OperationPool`](crate::scheduler::OperationPool).

pub mod assignment;
pub mod cleanup;
pub mod controller;
pub mod retries;
pub mod timeouts;
pub mod updates;

pub use assignment::{plan_assignments, AssignmentPlan, QueueAssignmentEngine};
pub use cleanup::{CleanupReport, QueueCleaner};
pub use controller::{ControllerHandle, ControllerOperation, QueueController};
pub use retries::RetryReaper;
pub use timeouts::TimeoutReaper;
pub use updates::{UpdateCascadeProcessor, UpdateStrategy};

use crate::error::{SchedulerError, SchedulerResult};
use std::future::Future;
use std::time::Duration;

/// Bound a storage round-trip. The call itself is not cancelled at the
/// storage layer; only its result is abandoned.
pub(crate) async fn with_timeout<T, F>(operation: &str, limit: Duration, fut: F) -> SchedulerResult<T>
where
    F: Future<Output = SchedulerResult<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| SchedulerError::timeout(operation, limit))?
}
