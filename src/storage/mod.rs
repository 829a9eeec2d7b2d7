//! # Storage Engine
//!
//! The query surface the scheduling core depends on. Implementations must
//! make every claim a single atomic `queued: true -> false` transition and
//! must skip rows held by a concurrent claimer instead of blocking on them;
//! the per-tenant single-flight guarantee of the operation pools does not
//! extend across controller instances.
//!
//! Two engines are provided:
//!
//! - [`InMemoryStorage`]: a complete engine behind one mutex, used by tests
//!   and local development.
//! - [`PostgresStorage`]: `sqlx` over the queue tables, claiming with
//!   `FOR UPDATE SKIP LOCKED`.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryStorage;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStorage;

use crate::error::SchedulerResult;
use crate::models::{
    CompletedWorkflowRun, NewInternalQueueItem, NewQueueItem, QueueItem, StepRunForEngine,
    WorkerSlots,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Queue-like tables subject to processed-row cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueTable {
    Queue,
    Retry,
    Timeout,
    Internal,
}

impl QueueTable {
    pub const ALL: [QueueTable; 4] = [
        QueueTable::Queue,
        QueueTable::Retry,
        QueueTable::Timeout,
        QueueTable::Internal,
    ];

    pub fn table_name(&self) -> &'static str {
        match self {
            QueueTable::Queue => "QueueItem",
            QueueTable::Retry => "RetryQueueItem",
            QueueTable::Timeout => "TimeoutQueueItem",
            QueueTable::Internal => "InternalQueueItem",
        }
    }
}

impl fmt::Display for QueueTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// A queue entry matched to a worker by the assignment planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlannedAssignment {
    pub queue_item_id: i64,
    pub step_run_id: Uuid,
    pub worker_id: Uuid,
    pub dispatcher_id: Uuid,
}

/// A queue entry whose schedule deadline passed before it could be assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchedulingTimeout {
    pub queue_item_id: i64,
    pub step_run_id: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentCommit {
    pub assignments: Vec<PlannedAssignment>,
    pub scheduling_timed_out: Vec<SchedulingTimeout>,
}

impl AssignmentCommit {
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty() && self.scheduling_timed_out.is_empty()
    }
}

/// What actually happened when a plan was committed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOutcome {
    /// Entries this commit claimed and bound to a worker slot
    pub assigned: Vec<PlannedAssignment>,
    /// Step runs whose entries this commit claimed as scheduling-timed-out
    pub scheduling_timed_out: Vec<Uuid>,
    /// Entries left queued because the worker no longer had capacity
    pub rejected: Vec<i64>,
    /// Entries a concurrent claimer already took
    pub lost: Vec<i64>,
}

/// Result of applying accumulated step run status changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepRunUpdateResult {
    pub succeeded_step_runs: Vec<StepRunForEngine>,
    pub completed_workflow_runs: Vec<CompletedWorkflowRun>,
    /// More updates are pending for the tenant
    pub should_continue: bool,
}

/// Rows consumed by a reap, plus whether another page is likely waiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReapResult<T> {
    pub items: Vec<T>,
    pub should_continue: bool,
}

impl<T> Default for ReapResult<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            should_continue: false,
        }
    }
}

/// Inclusive id range of processed (unqueued) rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedRange {
    pub min_id: i64,
    pub max_id: i64,
}

#[async_trait]
pub trait StorageEngine: Send + Sync + 'static {
    /// Tenants served by the given controller partition.
    async fn list_tenants_by_partition(&self, partition_id: &str) -> SchedulerResult<Vec<Uuid>>;

    /// Queues for the tenant that were active within the last day.
    async fn list_queues(&self, tenant_id: Uuid) -> SchedulerResult<Vec<String>>;

    /// Queued entries of one queue in priority-desc, id-asc order, without claiming them.
    async fn list_queue_items(
        &self,
        tenant_id: Uuid,
        queue: &str,
        limit: usize,
    ) -> SchedulerResult<Vec<QueueItem>>;

    /// Remaining capacity of every eligible worker with at least one free slot.
    async fn list_available_slots(
        &self,
        tenant_id: Uuid,
        heartbeat_window: Duration,
    ) -> SchedulerResult<Vec<WorkerSlots>>;

    /// Atomically claim the planned entries. Entries already unqueued are
    /// reported as lost; assignments beyond a worker's current capacity are
    /// rejected and stay queued.
    async fn commit_assignments(
        &self,
        tenant_id: Uuid,
        commit: AssignmentCommit,
    ) -> SchedulerResult<CommitOutcome>;

    /// Apply queued step run updates (legacy path).
    async fn process_step_run_updates(
        &self,
        tenant_id: Uuid,
        limit: usize,
    ) -> SchedulerResult<StepRunUpdateResult>;

    /// Apply queued step run updates (v2 path). Startable children of
    /// succeeded step runs are queued by storage itself.
    async fn process_step_run_updates_v2(
        &self,
        tenant_id: Uuid,
        limit: usize,
    ) -> SchedulerResult<StepRunUpdateResult>;

    /// Pending step runs of the job run whose parents have all succeeded,
    /// restricted to children of `parent_step_run_id` when given.
    async fn list_startable_step_runs(
        &self,
        tenant_id: Uuid,
        job_run_id: Uuid,
        parent_step_run_id: Option<Uuid>,
    ) -> SchedulerResult<Vec<StepRunForEngine>>;

    /// Pop expired timeout entries and return their (non-final) step runs.
    async fn list_step_runs_to_timeout(
        &self,
        tenant_id: Uuid,
        limit: usize,
    ) -> SchedulerResult<ReapResult<StepRunForEngine>>;

    /// Pop elapsed retry entries and return their (non-final) step runs.
    async fn list_step_runs_to_retry(
        &self,
        tenant_id: Uuid,
        limit: usize,
    ) -> SchedulerResult<ReapResult<StepRunForEngine>>;

    async fn get_min_max_processed(
        &self,
        tenant_id: Uuid,
        table: QueueTable,
    ) -> SchedulerResult<Option<ProcessedRange>>;

    /// Delete processed rows with ids in `[min_id, max_id]`; returns rows deleted.
    async fn cleanup_processed(
        &self,
        tenant_id: Uuid,
        table: QueueTable,
        min_id: i64,
        max_id: i64,
    ) -> SchedulerResult<u64>;

    /// Insert ready-queue entries; returned ids are in input order.
    async fn create_queue_items_bulk(&self, items: Vec<NewQueueItem>) -> SchedulerResult<Vec<i64>>;

    /// Insert internal queue entries. Entries whose unique key is already
    /// queued are skipped, so fewer ids than inputs may be returned.
    async fn create_internal_queue_items_bulk(
        &self,
        items: Vec<NewInternalQueueItem>,
    ) -> SchedulerResult<Vec<i64>>;

    async fn create_timeout_queue_item(
        &self,
        tenant_id: Uuid,
        step_run_id: Uuid,
        retry_count: i32,
        timeout_at: DateTime<Utc>,
    ) -> SchedulerResult<i64>;

    async fn create_retry_queue_item(
        &self,
        tenant_id: Uuid,
        step_run_id: Uuid,
        retry_after: DateTime<Utc>,
    ) -> SchedulerResult<i64>;
}
