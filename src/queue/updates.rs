//! # Update Cascade Processor
//!
//! Applies accumulated step run status changes for one tenant, then fans
//! the results out:
//!
//! - every succeeded step run with children is checked for startable
//!   children, each announced with `step-run-queued` on the job-processing
//!   channel (legacy strategy only; the v2 storage path queues them itself)
//! - every workflow run that reached a terminal status is announced with
//!   `workflow-run-finished` on the workflow-processing channel
//!
//! Both strategies run side by side while tenants migrate between the two
//! storage paths. Notification failures are logged per message and never
//! fail the operation; only the storage call does.

use super::with_timeout;
use crate::config::QueueConfig;
use crate::error::SchedulerResult;
use crate::logging::QUEUE_LOG_TARGET;
use crate::messaging::{MessageQueue, QueueMessage, QueueType};
use crate::models::{CompletedWorkflowRun, StepRunForEngine};
use crate::scheduler::make_batched;
use crate::storage::{StepRunUpdateResult, StorageEngine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, instrument};
use uuid::Uuid;

/// Which storage path applies the updates, and who owns the child cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStrategy {
    /// Storage applies updates; this processor cascades to startable children.
    V1,
    /// Storage applies updates and queues startable children in the same pass.
    V2,
}

impl UpdateStrategy {
    pub fn pool_description(&self) -> &'static str {
        match self {
            UpdateStrategy::V1 => "update step runs",
            UpdateStrategy::V2 => "update step runs (v2)",
        }
    }

    /// Whether this processor must look up and announce startable children.
    pub fn cascades_children(&self) -> bool {
        matches!(self, UpdateStrategy::V1)
    }
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateStrategy::V1 => f.write_str("v1"),
            UpdateStrategy::V2 => f.write_str("v2"),
        }
    }
}

pub struct UpdateCascadeProcessor {
    storage: Arc<dyn StorageEngine>,
    transport: Arc<dyn MessageQueue>,
    config: QueueConfig,
    strategy: UpdateStrategy,
}

impl UpdateCascadeProcessor {
    pub fn new(
        storage: Arc<dyn StorageEngine>,
        transport: Arc<dyn MessageQueue>,
        config: QueueConfig,
        strategy: UpdateStrategy,
    ) -> Self {
        Self {
            storage,
            transport,
            config,
            strategy,
        }
    }

    pub fn strategy(&self) -> UpdateStrategy {
        self.strategy
    }

    /// Apply pending updates and notify. Returns whether more updates remain.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, strategy = %self.strategy))]
    pub async fn process_step_run_updates(&self, tenant_id: Uuid) -> SchedulerResult<bool> {
        let result = with_timeout(
            "process step run updates",
            self.config.update_timeout(),
            self.apply(tenant_id),
        )
        .await
        .map_err(|e| e.context(&format!("could not process step run updates ({})", self.strategy)))?;

        debug!(
            target: QUEUE_LOG_TARGET,
            tenant_id = %tenant_id,
            succeeded = result.succeeded_step_runs.len(),
            completed_workflow_runs = result.completed_workflow_runs.len(),
            should_continue = result.should_continue,
            "Applied step run updates"
        );

        if self.strategy.cascades_children() {
            self.queue_startable_children(result.succeeded_step_runs)
                .await
                .map_err(|e| e.context("could not process succeeded step runs"))?;
        }

        self.notify_finished(tenant_id, &result.completed_workflow_runs)
            .await;

        Ok(result.should_continue)
    }

    async fn apply(&self, tenant_id: Uuid) -> SchedulerResult<StepRunUpdateResult> {
        match self.strategy {
            UpdateStrategy::V1 => {
                self.storage
                    .process_step_run_updates(tenant_id, self.config.update_limit)
                    .await
            }
            UpdateStrategy::V2 => {
                self.storage
                    .process_step_run_updates_v2(tenant_id, self.config.update_limit)
                    .await
            }
        }
    }

    async fn queue_startable_children(
        &self,
        succeeded: Vec<StepRunForEngine>,
    ) -> SchedulerResult<()> {
        make_batched(self.config.cascade_batch_size, succeeded, |group| async move {
            for step_run in group {
                if step_run.child_count == 0 {
                    continue;
                }

                let next = match self
                    .storage
                    .list_startable_step_runs(step_run.tenant_id, step_run.job_run_id, Some(step_run.id))
                    .await
                {
                    Ok(next) => next,
                    Err(e) => {
                        error!(
                            target: QUEUE_LOG_TARGET,
                            step_run_id = %step_run.id,
                            error = %e,
                            "Could not list startable step runs"
                        );
                        continue;
                    }
                };

                for child in &next {
                    let sent = async {
                        let message = QueueMessage::step_run_queued(child)?;
                        self.transport
                            .add_message(&QueueType::JobProcessing, message)
                            .await
                    }
                    .await;

                    if let Err(e) = sent {
                        error!(
                            target: QUEUE_LOG_TARGET,
                            step_run_id = %child.id,
                            error = %e,
                            "Could not queue next step run"
                        );
                    }
                }
            }
            Ok(())
        })
        .await
    }

    async fn notify_finished(&self, tenant_id: Uuid, finished: &[CompletedWorkflowRun]) {
        for workflow_run in finished {
            let sent = async {
                let message = QueueMessage::workflow_run_finished(
                    tenant_id,
                    workflow_run.id,
                    workflow_run.status,
                )?;
                self.transport
                    .add_message(&QueueType::WorkflowProcessing, message)
                    .await
            }
            .await;

            if let Err(e) = sent {
                error!(
                    target: QUEUE_LOG_TARGET,
                    tenant_id = %tenant_id,
                    workflow_run_id = %workflow_run.id,
                    strategy = %self.strategy,
                    error = %e,
                    "Could not add workflow run finished task to task queue"
                );
            }
        }
    }
}
