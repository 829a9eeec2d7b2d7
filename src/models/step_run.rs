//! Step run rows and the status changes applied to them.

use crate::constants::{StepRunStatus, WorkflowRunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Full step run row, including its dependency edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRun {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub job_run_id: Uuid,
    pub workflow_run_id: Uuid,
    pub action_id: String,
    pub status: StepRunStatus,
    /// Step runs that must succeed before this one becomes startable
    pub parent_ids: Vec<Uuid>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub worker_id: Option<Uuid>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRun {
    pub fn new(
        tenant_id: Uuid,
        workflow_run_id: Uuid,
        job_run_id: Uuid,
        action_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            job_run_id,
            workflow_run_id,
            action_id: action_id.into(),
            status: StepRunStatus::Pending,
            parent_ids: Vec::new(),
            retry_count: 0,
            max_retries: 0,
            worker_id: None,
            output: None,
            error: None,
            finished_at: None,
        }
    }

    pub fn with_parents(mut self, parent_ids: Vec<Uuid>) -> Self {
        self.parent_ids = parent_ids;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_status(mut self, status: StepRunStatus) -> Self {
        self.status = status;
        self
    }
}

/// Projection of a step run returned by the engine-facing storage calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRunForEngine {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub job_run_id: Uuid,
    pub workflow_run_id: Uuid,
    pub action_id: String,
    pub status: StepRunStatus,
    pub child_count: i64,
    pub retry_count: i32,
}

impl StepRunForEngine {
    pub fn from_step_run(step_run: &StepRun, child_count: i64) -> Self {
        Self {
            id: step_run.id,
            tenant_id: step_run.tenant_id,
            job_run_id: step_run.job_run_id,
            workflow_run_id: step_run.workflow_run_id,
            action_id: step_run.action_id.clone(),
            status: step_run.status,
            child_count,
            retry_count: step_run.retry_count,
        }
    }
}

/// A workflow run that reached a terminal status during an update pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedWorkflowRun {
    pub id: Uuid,
    pub status: WorkflowRunStatus,
}

/// A status change reported for a step run, applied by the update pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StepRunEvent {
    Started { worker_id: Uuid },
    Succeeded { output: Option<serde_json::Value> },
    Failed { error: String },
    Cancelled { reason: String },
}

impl StepRunEvent {
    pub fn resulting_status(&self) -> StepRunStatus {
        match self {
            StepRunEvent::Started { .. } => StepRunStatus::Running,
            StepRunEvent::Succeeded { .. } => StepRunStatus::Succeeded,
            StepRunEvent::Failed { .. } => StepRunStatus::Failed,
            StepRunEvent::Cancelled { .. } => StepRunStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRunUpdate {
    pub step_run_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: StepRunEvent,
}

impl StepRunUpdate {
    pub fn new(step_run_id: Uuid, event: StepRunEvent) -> Self {
        Self {
            step_run_id,
            occurred_at: Utc::now(),
            event,
        }
    }
}
