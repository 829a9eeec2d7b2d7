//! # In-Memory Storage Engine
//!
//! Complete [`StorageEngine`] over plain collections behind a single mutex.
//! Every trait call is one critical section, so claims are trivially atomic
//! and two concurrent commits can never both flip the same entry.
//!
//! ## Test Hooks
//!
//! - Seeding helpers (`add_tenant`, `upsert_worker`, `insert_step_run`, ...)
//! - `fail_next` injects a database error into the next N calls of an operation
//! - `set_latency` delays every call, for timeout tests under a paused clock
//! - `call_count` reports how often an operation was invoked

use super::{
    AssignmentCommit, CommitOutcome, ProcessedRange, QueueTable, ReapResult, StepRunUpdateResult,
    StorageEngine,
};
use crate::constants::{defaults, StepRunStatus, WorkflowRunStatus};
use crate::error::{SchedulerError, SchedulerResult};
use crate::models::{
    CompletedWorkflowRun, InternalQueue, InternalQueueItem, NewInternalQueueItem, NewQueueItem,
    Priority, QueueItem, RetryQueueItem, SlotClaim, StepRun, StepRunEvent, StepRunForEngine,
    StepRunUpdate, Tenant, TimeoutQueueItem, Worker, WorkerSlots,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
struct MemoryState {
    tenants: HashMap<Uuid, Tenant>,
    /// (tenant, queue name) -> last time an entry was written to the queue
    queues: HashMap<(Uuid, String), DateTime<Utc>>,
    queue_items: BTreeMap<i64, QueueItem>,
    retry_items: BTreeMap<i64, RetryQueueItem>,
    timeout_items: BTreeMap<i64, TimeoutQueueItem>,
    internal_items: BTreeMap<i64, InternalQueueItem>,
    step_runs: HashMap<Uuid, StepRun>,
    workers: HashMap<Uuid, Worker>,
    /// step run id -> claim
    slot_claims: HashMap<Uuid, SlotClaim>,
    completed_workflows: HashSet<Uuid>,
    next_id: i64,
    failures: HashMap<&'static str, usize>,
    calls: HashMap<&'static str, usize>,
    latency: Option<Duration>,
}

impl MemoryState {
    fn begin(&mut self, operation: &'static str) -> SchedulerResult<()> {
        *self.calls.entry(operation).or_default() += 1;

        if let Some(remaining) = self.failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SchedulerError::Database(format!(
                    "injected failure in {operation}"
                )));
            }
        }
        Ok(())
    }

    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn touch_queue(&mut self, tenant_id: Uuid, queue: &str, now: DateTime<Utc>) {
        self.queues.insert((tenant_id, queue.to_string()), now);
    }

    fn child_count(&self, step_run_id: Uuid) -> i64 {
        self.step_runs
            .values()
            .filter(|candidate| candidate.parent_ids.contains(&step_run_id))
            .count() as i64
    }

    fn project(&self, step_run: &StepRun) -> StepRunForEngine {
        StepRunForEngine::from_step_run(step_run, self.child_count(step_run.id))
    }

    fn filled_slots(&self, worker_id: Uuid) -> i32 {
        self.slot_claims
            .values()
            .filter(|claim| claim.worker_id == worker_id)
            .count() as i32
    }

    fn release_step_run(&mut self, step_run_id: Uuid) {
        self.slot_claims.remove(&step_run_id);
        self.timeout_items
            .retain(|_, item| !(item.step_run_id == step_run_id && item.queued));
    }

    fn startable_children(
        &self,
        tenant_id: Uuid,
        job_run_id: Uuid,
        parent_step_run_id: Option<Uuid>,
    ) -> Vec<StepRunForEngine> {
        let mut startable: Vec<&StepRun> = self
            .step_runs
            .values()
            .filter(|candidate| {
                candidate.tenant_id == tenant_id
                    && candidate.job_run_id == job_run_id
                    && candidate.status == StepRunStatus::Pending
            })
            .filter(|candidate| {
                parent_step_run_id
                    .map(|parent| candidate.parent_ids.contains(&parent))
                    .unwrap_or(true)
            })
            .filter(|candidate| {
                candidate.parent_ids.iter().all(|parent| {
                    self.step_runs
                        .get(parent)
                        .map(|p| p.status == StepRunStatus::Succeeded)
                        .unwrap_or(false)
                })
            })
            .collect();

        startable.sort_by_key(|step_run| step_run.id);
        startable.into_iter().map(|sr| self.project(sr)).collect()
    }

    fn pop_internal(&mut self, tenant_id: Uuid, queue: InternalQueue, limit: usize) -> Vec<InternalQueueItem> {
        let mut candidates: Vec<&InternalQueueItem> = self
            .internal_items
            .values()
            .filter(|item| item.queued && item.tenant_id == tenant_id && item.queue == queue)
            .collect();
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        let ids: Vec<i64> = candidates.into_iter().take(limit).map(|item| item.id).collect();

        ids.iter()
            .filter_map(|id| {
                self.internal_items.get_mut(id).map(|item| {
                    item.queued = false;
                    item.clone()
                })
            })
            .collect()
    }

    /// Shared body of both update paths.
    fn apply_updates(
        &mut self,
        tenant_id: Uuid,
        queue: InternalQueue,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StepRunUpdateResult {
        let popped = self.pop_internal(tenant_id, queue, limit);
        let should_continue = popped.len() == limit;

        let mut succeeded = Vec::new();
        let mut touched_workflows = Vec::new();

        for item in popped {
            let update: StepRunUpdate = match serde_json::from_value(item.data.clone()) {
                Ok(update) => update,
                Err(e) => {
                    warn!(item_id = item.id, error = %e, "Skipping malformed step run update");
                    continue;
                }
            };

            let Some(step_run) = self.step_runs.get(&update.step_run_id).cloned() else {
                warn!(step_run_id = %update.step_run_id, "Skipping update for unknown step run");
                continue;
            };
            if step_run.tenant_id != tenant_id || step_run.status.is_terminal() {
                continue;
            }

            let mut step_run = step_run;
            match update.event {
                StepRunEvent::Started { worker_id } => {
                    step_run.status = StepRunStatus::Running;
                    step_run.worker_id = Some(worker_id);
                }
                StepRunEvent::Succeeded { output } => {
                    self.release_step_run(step_run.id);
                    step_run.status = StepRunStatus::Succeeded;
                    step_run.output = output;
                    step_run.finished_at = Some(update.occurred_at);
                    succeeded.push(step_run.id);
                }
                StepRunEvent::Failed { error } => {
                    self.release_step_run(step_run.id);
                    step_run.error = Some(error);
                    if step_run.retry_count < step_run.max_retries {
                        step_run.retry_count += 1;
                        step_run.status = StepRunStatus::Pending;
                        step_run.worker_id = None;
                        let id = self.next_id();
                        self.retry_items.insert(
                            id,
                            RetryQueueItem {
                                id,
                                step_run_id: step_run.id,
                                retry_after: now,
                                tenant_id,
                                queued: true,
                            },
                        );
                    } else {
                        step_run.status = StepRunStatus::Failed;
                        step_run.finished_at = Some(update.occurred_at);
                    }
                }
                StepRunEvent::Cancelled { reason } => {
                    self.release_step_run(step_run.id);
                    step_run.status = StepRunStatus::Cancelled;
                    step_run.error = Some(reason);
                    step_run.finished_at = Some(update.occurred_at);
                }
            }

            if !touched_workflows.contains(&step_run.workflow_run_id) {
                touched_workflows.push(step_run.workflow_run_id);
            }
            self.step_runs.insert(step_run.id, step_run);
        }

        let mut completed_workflow_runs = Vec::new();
        for workflow_run_id in touched_workflows {
            if self.completed_workflows.contains(&workflow_run_id) {
                continue;
            }
            let statuses: Vec<StepRunStatus> = self
                .step_runs
                .values()
                .filter(|sr| sr.workflow_run_id == workflow_run_id)
                .map(|sr| sr.status)
                .collect();

            if statuses.is_empty() || !statuses.iter().all(StepRunStatus::is_terminal) {
                continue;
            }

            let status = if statuses.contains(&StepRunStatus::Failed) {
                WorkflowRunStatus::Failed
            } else if statuses.contains(&StepRunStatus::Cancelled) {
                WorkflowRunStatus::Cancelled
            } else {
                WorkflowRunStatus::Succeeded
            };

            self.completed_workflows.insert(workflow_run_id);
            completed_workflow_runs.push(CompletedWorkflowRun {
                id: workflow_run_id,
                status,
            });
        }

        let succeeded_step_runs = succeeded
            .into_iter()
            .filter_map(|id| self.step_runs.get(&id).map(|sr| self.project(sr)))
            .collect();

        StepRunUpdateResult {
            succeeded_step_runs,
            completed_workflow_runs,
            should_continue,
        }
    }

    fn insert_queue_item(&mut self, item: NewQueueItem, now: DateTime<Utc>) -> i64 {
        let id = self.next_id();
        self.touch_queue(item.tenant_id, &item.queue, now);
        self.queue_items.insert(id, item.into_queue_item(id));
        id
    }

    fn processed_ids(&self, tenant_id: Uuid, table: QueueTable) -> Vec<i64> {
        match table {
            QueueTable::Queue => self
                .queue_items
                .values()
                .filter(|i| !i.queued && i.tenant_id == tenant_id)
                .map(|i| i.id)
                .collect(),
            QueueTable::Retry => self
                .retry_items
                .values()
                .filter(|i| !i.queued && i.tenant_id == tenant_id)
                .map(|i| i.id)
                .collect(),
            QueueTable::Timeout => self
                .timeout_items
                .values()
                .filter(|i| !i.queued && i.tenant_id == tenant_id)
                .map(|i| i.id)
                .collect(),
            QueueTable::Internal => self
                .internal_items
                .values()
                .filter(|i| !i.queued && i.tenant_id == tenant_id)
                .map(|i| i.id)
                .collect(),
        }
    }
}

/// In-memory storage engine for testing and development
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    state: Mutex<MemoryState>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tenant(&self, tenant: Tenant) {
        self.state.lock().tenants.insert(tenant.id, tenant);
    }

    pub fn remove_tenant(&self, tenant_id: Uuid) {
        self.state.lock().tenants.remove(&tenant_id);
    }

    pub fn upsert_worker(&self, worker: Worker) {
        self.state.lock().workers.insert(worker.id, worker);
    }

    pub fn heartbeat(&self, worker_id: Uuid, at: DateTime<Utc>) {
        if let Some(worker) = self.state.lock().workers.get_mut(&worker_id) {
            worker.last_heartbeat_at = at;
        }
    }

    pub fn insert_step_run(&self, step_run: StepRun) {
        self.state.lock().step_runs.insert(step_run.id, step_run);
    }

    pub fn step_run(&self, step_run_id: Uuid) -> Option<StepRun> {
        self.state.lock().step_runs.get(&step_run_id).cloned()
    }

    pub fn queue_item(&self, id: i64) -> Option<QueueItem> {
        self.state.lock().queue_items.get(&id).cloned()
    }

    pub fn queue_items_for(&self, tenant_id: Uuid) -> Vec<QueueItem> {
        self.state
            .lock()
            .queue_items
            .values()
            .filter(|item| item.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    pub fn timeout_item(&self, id: i64) -> Option<TimeoutQueueItem> {
        self.state.lock().timeout_items.get(&id).cloned()
    }

    pub fn retry_item(&self, id: i64) -> Option<RetryQueueItem> {
        self.state.lock().retry_items.get(&id).cloned()
    }

    pub fn filled_slots(&self, worker_id: Uuid) -> i32 {
        self.state.lock().filled_slots(worker_id)
    }

    pub fn row_count(&self, tenant_id: Uuid, table: QueueTable) -> usize {
        let state = self.state.lock();
        match table {
            QueueTable::Queue => state.queue_items.values().filter(|i| i.tenant_id == tenant_id).count(),
            QueueTable::Retry => state.retry_items.values().filter(|i| i.tenant_id == tenant_id).count(),
            QueueTable::Timeout => state.timeout_items.values().filter(|i| i.tenant_id == tenant_id).count(),
            QueueTable::Internal => state.internal_items.values().filter(|i| i.tenant_id == tenant_id).count(),
        }
    }

    /// Record a status change on the internal queue consumed by the given update path.
    pub fn record_step_run_update(
        &self,
        tenant_id: Uuid,
        update: StepRunUpdate,
        queue: InternalQueue,
    ) -> SchedulerResult<i64> {
        let data = serde_json::to_value(&update)?;
        let mut state = self.state.lock();
        let id = state.next_id();
        state.internal_items.insert(
            id,
            InternalQueueItem {
                id,
                tenant_id,
                queue,
                priority: Priority::LOW,
                unique_key: None,
                data,
                queued: true,
            },
        );
        Ok(id)
    }

    /// Fail the next `times` calls of `operation` with a database error.
    pub fn fail_next(&self, operation: &'static str, times: usize) {
        self.state.lock().failures.insert(operation, times);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    pub fn call_count(&self, operation: &'static str) -> usize {
        self.state.lock().calls.get(operation).copied().unwrap_or(0)
    }

    async fn simulate_latency(&self) {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl StorageEngine for InMemoryStorage {
    async fn list_tenants_by_partition(&self, partition_id: &str) -> SchedulerResult<Vec<Uuid>> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin("list_tenants_by_partition")?;

        let mut tenants: Vec<Uuid> = state
            .tenants
            .values()
            .filter(|t| t.controller_partition_id.as_deref() == Some(partition_id))
            .map(|t| t.id)
            .collect();
        tenants.sort();
        Ok(tenants)
    }

    async fn list_queues(&self, tenant_id: Uuid) -> SchedulerResult<Vec<String>> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin("list_queues")?;

        let window = chrono::Duration::from_std(defaults::QUEUE_ACTIVE_WINDOW)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let cutoff = Utc::now() - window;

        let mut queues: Vec<String> = state
            .queues
            .iter()
            .filter(|((tenant, _), last_active)| *tenant == tenant_id && **last_active > cutoff)
            .map(|((_, name), _)| name.clone())
            .collect();
        queues.sort();
        Ok(queues)
    }

    async fn list_queue_items(
        &self,
        tenant_id: Uuid,
        queue: &str,
        limit: usize,
    ) -> SchedulerResult<Vec<QueueItem>> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin("list_queue_items")?;

        let mut items: Vec<QueueItem> = state
            .queue_items
            .values()
            .filter(|item| item.queued && item.tenant_id == tenant_id && item.queue == queue)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        items.truncate(limit);
        Ok(items)
    }

    async fn list_available_slots(
        &self,
        tenant_id: Uuid,
        heartbeat_window: Duration,
    ) -> SchedulerResult<Vec<WorkerSlots>> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin("list_available_slots")?;
        let now = Utc::now();

        let mut slots: Vec<WorkerSlots> = state
            .workers
            .values()
            .filter(|w| w.tenant_id == tenant_id && w.is_eligible(now, heartbeat_window))
            .filter_map(|w| {
                let available = w.max_runs - state.filled_slots(w.id);
                let dispatcher_id = w.dispatcher_id?;
                (available > 0).then(|| WorkerSlots {
                    worker_id: w.id,
                    dispatcher_id,
                    available_slots: available,
                    actions: w.actions.clone(),
                })
            })
            .collect();
        slots.sort_by_key(|s| s.worker_id);
        Ok(slots)
    }

    async fn commit_assignments(
        &self,
        tenant_id: Uuid,
        commit: AssignmentCommit,
    ) -> SchedulerResult<CommitOutcome> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin("commit_assignments")?;

        let mut outcome = CommitOutcome::default();

        for timed_out in commit.scheduling_timed_out {
            match state.queue_items.get_mut(&timed_out.queue_item_id) {
                Some(item) if item.queued && item.tenant_id == tenant_id => {
                    item.queued = false;
                    outcome.scheduling_timed_out.push(timed_out.step_run_id);
                }
                _ => outcome.lost.push(timed_out.queue_item_id),
            }
        }

        for assignment in commit.assignments {
            let still_queued = state
                .queue_items
                .get(&assignment.queue_item_id)
                .map(|item| item.queued && item.tenant_id == tenant_id)
                .unwrap_or(false);
            if !still_queued {
                outcome.lost.push(assignment.queue_item_id);
                continue;
            }

            let capacity = state
                .workers
                .get(&assignment.worker_id)
                .filter(|w| {
                    w.tenant_id == tenant_id && w.is_active && !w.is_paused && w.dispatcher_id.is_some()
                })
                .map(|w| w.max_runs)
                .unwrap_or(0);
            if capacity - state.filled_slots(assignment.worker_id) <= 0 {
                outcome.rejected.push(assignment.queue_item_id);
                continue;
            }

            if let Some(item) = state.queue_items.get_mut(&assignment.queue_item_id) {
                item.queued = false;
            }
            state.slot_claims.insert(
                assignment.step_run_id,
                SlotClaim {
                    worker_id: assignment.worker_id,
                    step_run_id: assignment.step_run_id,
                },
            );
            if let Some(step_run) = state.step_runs.get_mut(&assignment.step_run_id) {
                step_run.status = StepRunStatus::Assigned;
                step_run.worker_id = Some(assignment.worker_id);
            }
            outcome.assigned.push(assignment);
        }

        debug!(
            tenant_id = %tenant_id,
            assigned = outcome.assigned.len(),
            timed_out = outcome.scheduling_timed_out.len(),
            rejected = outcome.rejected.len(),
            lost = outcome.lost.len(),
            "Committed assignment plan"
        );

        Ok(outcome)
    }

    async fn process_step_run_updates(
        &self,
        tenant_id: Uuid,
        limit: usize,
    ) -> SchedulerResult<StepRunUpdateResult> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin("process_step_run_updates")?;
        Ok(state.apply_updates(tenant_id, InternalQueue::StepRunUpdate, limit, Utc::now()))
    }

    async fn process_step_run_updates_v2(
        &self,
        tenant_id: Uuid,
        limit: usize,
    ) -> SchedulerResult<StepRunUpdateResult> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin("process_step_run_updates_v2")?;
        let now = Utc::now();

        let result = state.apply_updates(tenant_id, InternalQueue::StepRunUpdateV2, limit, now);

        for parent in result.succeeded_step_runs.iter().filter(|sr| sr.child_count > 0) {
            for child in state.startable_children(tenant_id, parent.job_run_id, Some(parent.id)) {
                if let Some(step_run) = state.step_runs.get_mut(&child.id) {
                    step_run.status = StepRunStatus::PendingAssignment;
                }
                let item = NewQueueItem::new(tenant_id, child.action_id.clone(), child.id, child.action_id);
                state.insert_queue_item(item, now);
            }
        }

        Ok(result)
    }

    async fn list_startable_step_runs(
        &self,
        tenant_id: Uuid,
        job_run_id: Uuid,
        parent_step_run_id: Option<Uuid>,
    ) -> SchedulerResult<Vec<StepRunForEngine>> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin("list_startable_step_runs")?;
        Ok(state.startable_children(tenant_id, job_run_id, parent_step_run_id))
    }

    async fn list_step_runs_to_timeout(
        &self,
        tenant_id: Uuid,
        limit: usize,
    ) -> SchedulerResult<ReapResult<StepRunForEngine>> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin("list_step_runs_to_timeout")?;
        let now = Utc::now();

        let mut expired: Vec<&TimeoutQueueItem> = state
            .timeout_items
            .values()
            .filter(|item| item.queued && item.tenant_id == tenant_id && item.timeout_at <= now)
            .collect();
        expired.sort_by(|a, b| a.timeout_at.cmp(&b.timeout_at).then(a.id.cmp(&b.id)));
        let popped: Vec<(i64, Uuid)> = expired
            .into_iter()
            .take(limit)
            .map(|item| (item.id, item.step_run_id))
            .collect();

        let mut items = Vec::with_capacity(popped.len());
        for (id, step_run_id) in &popped {
            if let Some(item) = state.timeout_items.get_mut(id) {
                item.queued = false;
            }
            if let Some(step_run) = state.step_runs.get(step_run_id) {
                if !step_run.status.is_final() {
                    items.push(state.project(step_run));
                }
            }
        }

        Ok(ReapResult {
            items,
            should_continue: popped.len() == limit,
        })
    }

    async fn list_step_runs_to_retry(
        &self,
        tenant_id: Uuid,
        limit: usize,
    ) -> SchedulerResult<ReapResult<StepRunForEngine>> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin("list_step_runs_to_retry")?;
        let now = Utc::now();

        let mut due: Vec<&RetryQueueItem> = state
            .retry_items
            .values()
            .filter(|item| item.queued && item.tenant_id == tenant_id && item.retry_after <= now)
            .collect();
        due.sort_by(|a, b| a.retry_after.cmp(&b.retry_after).then(a.id.cmp(&b.id)));
        let popped: Vec<(i64, Uuid)> = due
            .into_iter()
            .take(limit)
            .map(|item| (item.id, item.step_run_id))
            .collect();

        let mut items = Vec::with_capacity(popped.len());
        for (id, step_run_id) in &popped {
            if let Some(item) = state.retry_items.get_mut(id) {
                item.queued = false;
            }
            if let Some(step_run) = state.step_runs.get(step_run_id) {
                if !step_run.status.is_final() {
                    items.push(state.project(step_run));
                }
            }
        }

        Ok(ReapResult {
            items,
            should_continue: popped.len() == limit,
        })
    }

    async fn get_min_max_processed(
        &self,
        tenant_id: Uuid,
        table: QueueTable,
    ) -> SchedulerResult<Option<ProcessedRange>> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin("get_min_max_processed")?;

        let ids = state.processed_ids(tenant_id, table);
        Ok(match (ids.iter().min(), ids.iter().max()) {
            (Some(&min_id), Some(&max_id)) => Some(ProcessedRange { min_id, max_id }),
            _ => None,
        })
    }

    async fn cleanup_processed(
        &self,
        tenant_id: Uuid,
        table: QueueTable,
        min_id: i64,
        max_id: i64,
    ) -> SchedulerResult<u64> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin("cleanup_processed")?;

        let doomed: Vec<i64> = state
            .processed_ids(tenant_id, table)
            .into_iter()
            .filter(|id| (min_id..=max_id).contains(id))
            .collect();

        for id in &doomed {
            match table {
                QueueTable::Queue => {
                    state.queue_items.remove(id);
                }
                QueueTable::Retry => {
                    state.retry_items.remove(id);
                }
                QueueTable::Timeout => {
                    state.timeout_items.remove(id);
                }
                QueueTable::Internal => {
                    state.internal_items.remove(id);
                }
            }
        }
        Ok(doomed.len() as u64)
    }

    async fn create_queue_items_bulk(&self, items: Vec<NewQueueItem>) -> SchedulerResult<Vec<i64>> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin("create_queue_items_bulk")?;
        let now = Utc::now();

        Ok(items
            .into_iter()
            .map(|item| state.insert_queue_item(item, now))
            .collect())
    }

    async fn create_internal_queue_items_bulk(
        &self,
        items: Vec<NewInternalQueueItem>,
    ) -> SchedulerResult<Vec<i64>> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin("create_internal_queue_items_bulk")?;

        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            if let Some(key) = item.unique_key.as_deref() {
                let duplicate = state.internal_items.values().any(|existing| {
                    existing.queued
                        && existing.tenant_id == item.tenant_id
                        && existing.queue == item.queue
                        && existing.unique_key.as_deref() == Some(key)
                });
                if duplicate {
                    continue;
                }
            }

            let id = state.next_id();
            state.internal_items.insert(
                id,
                InternalQueueItem {
                    id,
                    tenant_id: item.tenant_id,
                    queue: item.queue,
                    priority: item.priority,
                    unique_key: item.unique_key,
                    data: item.data,
                    queued: true,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    async fn create_timeout_queue_item(
        &self,
        tenant_id: Uuid,
        step_run_id: Uuid,
        retry_count: i32,
        timeout_at: DateTime<Utc>,
    ) -> SchedulerResult<i64> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin("create_timeout_queue_item")?;

        let id = state.next_id();
        state.timeout_items.insert(
            id,
            TimeoutQueueItem {
                id,
                step_run_id,
                retry_count,
                timeout_at,
                tenant_id,
                queued: true,
            },
        );
        Ok(id)
    }

    async fn create_retry_queue_item(
        &self,
        tenant_id: Uuid,
        step_run_id: Uuid,
        retry_after: DateTime<Utc>,
    ) -> SchedulerResult<i64> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin("create_retry_queue_item")?;

        let id = state.next_id();
        state.retry_items.insert(
            id,
            RetryQueueItem {
                id,
                step_run_id,
                retry_after,
                tenant_id,
                queued: true,
            },
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{PlannedAssignment, SchedulingTimeout};

    fn seeded() -> (InMemoryStorage, Uuid) {
        let storage = InMemoryStorage::new();
        let tenant_id = Uuid::new_v4();
        storage.add_tenant(Tenant::new(tenant_id, "p1"));
        (storage, tenant_id)
    }

    #[tokio::test]
    async fn test_list_queue_items_orders_by_priority_then_id() {
        let (storage, tenant_id) = seeded();
        let items = [1, 2, 3, 4, 2, 4]
            .into_iter()
            .map(|p| {
                NewQueueItem::new(tenant_id, "default", Uuid::new_v4(), "svc:act")
                    .with_priority(Priority::new(p).unwrap())
            })
            .collect();
        let ids = storage.create_queue_items_bulk(items).await.unwrap();

        let listed = storage.list_queue_items(tenant_id, "default", 3).await.unwrap();
        let listed_ids: Vec<i64> = listed.iter().map(|i| i.id).collect();
        assert_eq!(listed_ids, vec![ids[3], ids[5], ids[2]]);
    }

    #[tokio::test]
    async fn test_commit_flips_queued_once() {
        let (storage, tenant_id) = seeded();
        let worker = Worker::new(tenant_id, Uuid::new_v4(), 5).with_actions(["svc:act"]);
        let (worker_id, dispatcher_id) = (worker.id, worker.dispatcher_id.unwrap());
        storage.upsert_worker(worker);

        let step_run_id = Uuid::new_v4();
        let ids = storage
            .create_queue_items_bulk(vec![NewQueueItem::new(tenant_id, "default", step_run_id, "svc:act")])
            .await
            .unwrap();

        let commit = AssignmentCommit {
            assignments: vec![PlannedAssignment {
                queue_item_id: ids[0],
                step_run_id,
                worker_id,
                dispatcher_id,
            }],
            scheduling_timed_out: vec![],
        };

        let first = storage.commit_assignments(tenant_id, commit.clone()).await.unwrap();
        let second = storage.commit_assignments(tenant_id, commit).await.unwrap();

        assert_eq!(first.assigned.len(), 1);
        assert!(second.assigned.is_empty());
        assert_eq!(second.lost, vec![ids[0]]);
        assert_eq!(storage.filled_slots(worker_id), 1);
    }

    #[tokio::test]
    async fn test_commit_rejects_over_capacity() {
        let (storage, tenant_id) = seeded();
        let worker = Worker::new(tenant_id, Uuid::new_v4(), 1).with_actions(["svc:act"]);
        let (worker_id, dispatcher_id) = (worker.id, worker.dispatcher_id.unwrap());
        storage.upsert_worker(worker);

        let step_runs = [Uuid::new_v4(), Uuid::new_v4()];
        let ids = storage
            .create_queue_items_bulk(
                step_runs
                    .iter()
                    .map(|sr| NewQueueItem::new(tenant_id, "default", *sr, "svc:act"))
                    .collect(),
            )
            .await
            .unwrap();

        let commit = AssignmentCommit {
            assignments: ids
                .iter()
                .zip(step_runs)
                .map(|(id, step_run_id)| PlannedAssignment {
                    queue_item_id: *id,
                    step_run_id,
                    worker_id,
                    dispatcher_id,
                })
                .collect(),
            scheduling_timed_out: vec![SchedulingTimeout {
                queue_item_id: 9999,
                step_run_id: Uuid::new_v4(),
            }],
        };

        let outcome = storage.commit_assignments(tenant_id, commit).await.unwrap();
        assert_eq!(outcome.assigned.len(), 1);
        assert_eq!(outcome.rejected, vec![ids[1]]);
        assert_eq!(outcome.lost, vec![9999]);
        assert!(storage.queue_item(ids[1]).unwrap().queued);
    }

    #[tokio::test]
    async fn test_internal_unique_key_dedup() {
        let (storage, tenant_id) = seeded();
        let item = NewInternalQueueItem {
            tenant_id,
            queue: InternalQueue::WorkflowRunUpdate,
            priority: Priority::LOW,
            unique_key: Some("wr-1".to_string()),
            data: serde_json::json!({}),
        };

        let ids = storage
            .create_internal_queue_items_bulk(vec![item.clone(), item])
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(storage.row_count(tenant_id, QueueTable::Internal), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed() {
        let (storage, _) = seeded();
        storage.fail_next("list_tenants_by_partition", 1);

        assert!(storage.list_tenants_by_partition("p1").await.is_err());
        assert_eq!(storage.list_tenants_by_partition("p1").await.unwrap().len(), 1);
        assert_eq!(storage.call_count("list_tenants_by_partition"), 2);
    }
}
