//! # Queue Assignment Engine
//!
//! Claims ready queue entries for one tenant and binds them to worker
//! capacity.
//!
//! ## Flow
//!
//! 1. List the tenant's active queues and peek up to `claim_limit` queued
//!    entries from each, together with the free slots of every eligible
//!    worker.
//! 2. Plan: walk the candidates in priority-desc, id-asc order. Entries past
//!    their schedule deadline become scheduling timeouts; the rest are
//!    matched to a worker that handles the action, has a free slot and
//!    satisfies the sticky strategy.
//! 3. Commit the plan. Storage flips `queued` atomically and reports entries
//!    a concurrent claimer got to first (lost) and entries a worker no
//!    longer has room for (rejected, still queued).
//! 4. Notify: one `step-run-assigned` per assignment on the dispatcher's
//!    channel, one `step-run-cancel` with `SCHEDULING_TIMED_OUT` per timeout
//!    on the job-processing channel. Send failures are aggregated, never
//!    short-circuited.
//!
//! Steps 1 to 3 run under the assignment timeout. Partial progress is
//! expected: the operation pool reruns the tenant while pages come back
//! full or commits race with other claimers.

use super::with_timeout;
use crate::config::QueueConfig;
use crate::constants::FailureReason;
use crate::error::{ErrorAggregator, SchedulerResult};
use crate::logging::QUEUE_LOG_TARGET;
use crate::messaging::{MessageQueue, QueueMessage, QueueType};
use crate::models::{QueueItem, StickyStrategy, WorkerSlots};
use crate::storage::{
    AssignmentCommit, CommitOutcome, PlannedAssignment, SchedulingTimeout, StorageEngine,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Output of the planning step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentPlan {
    pub commit: AssignmentCommit,
    /// Candidates no worker could take this pass
    pub unassigned: Vec<i64>,
}

#[derive(Debug)]
struct SlotState {
    worker_id: Uuid,
    dispatcher_id: Uuid,
    remaining: i32,
    actions: Vec<String>,
}

impl SlotState {
    fn can_take(&self, action_id: &str) -> bool {
        self.remaining > 0 && self.actions.iter().any(|a| a == action_id)
    }
}

/// Match candidates to worker capacity.
///
/// Candidates are processed in priority-desc, id-asc order regardless of the
/// order they are passed in. Unsticky work goes to the worker with the most
/// free slots, ties broken by the lower worker id.
pub fn plan_assignments(
    mut candidates: Vec<QueueItem>,
    slots: Vec<WorkerSlots>,
    now: DateTime<Utc>,
) -> AssignmentPlan {
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

    let mut workers: Vec<SlotState> = slots
        .into_iter()
        .filter(|s| s.available_slots > 0)
        .map(|s| SlotState {
            worker_id: s.worker_id,
            dispatcher_id: s.dispatcher_id,
            remaining: s.available_slots,
            actions: s.actions,
        })
        .collect();
    workers.sort_by_key(|w| w.worker_id);

    let mut plan = AssignmentPlan::default();

    for item in candidates {
        if item.is_scheduling_expired(now) {
            plan.commit.scheduling_timed_out.push(SchedulingTimeout {
                queue_item_id: item.id,
                step_run_id: item.step_run_id,
            });
            continue;
        }

        let desired = item
            .desired_worker_id
            .and_then(|desired| workers.iter().position(|w| w.worker_id == desired))
            .filter(|&index| workers[index].can_take(&item.action_id));

        let chosen = match (item.sticky, item.desired_worker_id) {
            (Some(StickyStrategy::Hard), Some(_)) => desired,
            (Some(StickyStrategy::Soft), Some(_)) => {
                desired.or_else(|| least_loaded(&workers, &item.action_id))
            }
            _ => least_loaded(&workers, &item.action_id),
        };

        match chosen {
            Some(index) => {
                let worker = &mut workers[index];
                worker.remaining -= 1;
                plan.commit.assignments.push(PlannedAssignment {
                    queue_item_id: item.id,
                    step_run_id: item.step_run_id,
                    worker_id: worker.worker_id,
                    dispatcher_id: worker.dispatcher_id,
                });
            }
            None => plan.unassigned.push(item.id),
        }
    }

    plan
}

fn least_loaded(workers: &[SlotState], action_id: &str) -> Option<usize> {
    workers
        .iter()
        .enumerate()
        .filter(|(_, w)| w.can_take(action_id))
        // `max_by_key` keeps the last maximum; reverse so the lowest id wins ties.
        .rev()
        .max_by_key(|(_, w)| w.remaining)
        .map(|(index, _)| index)
}

/// Claims and assigns queued step runs for one tenant at a time.
pub struct QueueAssignmentEngine {
    storage: Arc<dyn StorageEngine>,
    transport: Arc<dyn MessageQueue>,
    config: QueueConfig,
}

impl QueueAssignmentEngine {
    pub fn new(
        storage: Arc<dyn StorageEngine>,
        transport: Arc<dyn MessageQueue>,
        config: QueueConfig,
    ) -> Self {
        Self {
            storage,
            transport,
            config,
        }
    }

    /// Claim, assign and notify. Returns whether more work is likely waiting.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn schedule_step_runs(&self, tenant_id: Uuid) -> SchedulerResult<bool> {
        let (outcome, should_continue) = with_timeout(
            "queue step runs",
            self.config.assignment_timeout(),
            self.claim(tenant_id),
        )
        .await
        .map_err(|e| e.context("could not queue step runs"))?;

        if !outcome.assigned.is_empty() || !outcome.scheduling_timed_out.is_empty() {
            info!(
                target: QUEUE_LOG_TARGET,
                tenant_id = %tenant_id,
                assigned = outcome.assigned.len(),
                scheduling_timed_out = outcome.scheduling_timed_out.len(),
                rejected = outcome.rejected.len(),
                lost = outcome.lost.len(),
                "Assigned step runs"
            );
        }

        self.notify(tenant_id, &outcome).await?;
        Ok(should_continue)
    }

    async fn claim(&self, tenant_id: Uuid) -> SchedulerResult<(CommitOutcome, bool)> {
        let queues = self.storage.list_queues(tenant_id).await?;
        if queues.is_empty() {
            return Ok((CommitOutcome::default(), false));
        }

        let mut candidates = Vec::new();
        let mut full_page = false;
        for queue in &queues {
            let items = self
                .storage
                .list_queue_items(tenant_id, queue, self.config.claim_limit)
                .await?;
            full_page |= items.len() >= self.config.claim_limit;
            candidates.extend(items);
        }

        if candidates.is_empty() {
            return Ok((CommitOutcome::default(), false));
        }

        let slots = self
            .storage
            .list_available_slots(tenant_id, self.config.worker_heartbeat_window())
            .await?;

        let plan = plan_assignments(candidates, slots, Utc::now());
        debug!(
            target: QUEUE_LOG_TARGET,
            tenant_id = %tenant_id,
            queues = queues.len(),
            planned = plan.commit.assignments.len(),
            timed_out = plan.commit.scheduling_timed_out.len(),
            unassigned = plan.unassigned.len(),
            "Planned assignments"
        );

        // A full page nobody can take would be listed again unchanged
        if plan.commit.is_empty() {
            return Ok((CommitOutcome::default(), false));
        }

        let outcome = self.storage.commit_assignments(tenant_id, plan.commit).await?;
        // Rerun only when the next listing is bound to differ from this one
        let progressed = !outcome.assigned.is_empty() || !outcome.scheduling_timed_out.is_empty();
        let rerun = (progressed && (full_page || !outcome.rejected.is_empty()))
            || !outcome.lost.is_empty();
        Ok((outcome, rerun))
    }

    async fn notify(&self, tenant_id: Uuid, outcome: &CommitOutcome) -> SchedulerResult<()> {
        let mut errors = ErrorAggregator::new();

        for assigned in &outcome.assigned {
            let sent = async {
                let message = QueueMessage::step_run_assigned(
                    tenant_id,
                    assigned.step_run_id,
                    assigned.worker_id,
                    assigned.dispatcher_id,
                )?;
                self.transport
                    .add_message(&QueueType::dispatcher(assigned.dispatcher_id), message)
                    .await
            }
            .await;
            errors.record(sent.map_err(|e| e.context("could not send queued step run")));
        }

        for step_run_id in &outcome.scheduling_timed_out {
            let sent = async {
                let message = QueueMessage::step_run_cancel(
                    tenant_id,
                    *step_run_id,
                    FailureReason::SchedulingTimedOut,
                )?;
                self.transport
                    .add_message(&QueueType::JobProcessing, message)
                    .await
            }
            .await;
            errors.record(sent.map_err(|e| e.context("could not send cancel step run event")));
        }

        errors.into_result()
    }
}
