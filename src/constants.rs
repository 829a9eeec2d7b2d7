//! # System Constants
//!
//! Reason codes, message identifiers, queue names and the default timing
//! and batching limits of the scheduling core.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Message identifiers carried in the `id` field of every queue message.
pub mod message_ids {
    pub const CHECK_TENANT_QUEUE: &str = "check-tenant-queue";
    pub const STEP_RUN_ASSIGNED: &str = "step-run-assigned";
    pub const STEP_RUN_CANCEL: &str = "step-run-cancel";
    pub const STEP_RUN_FAILED: &str = "step-run-failed";
    pub const STEP_RUN_QUEUED: &str = "step-run-queued";
    pub const STEP_RUN_RETRY: &str = "step-run-retry";
    pub const WORKFLOW_RUN_FINISHED: &str = "workflow-run-finished";
    pub const ACTION_EVENT: &str = "action-event";
}

/// Logical transport queues shared by every controller instance.
pub mod queues {
    pub const JOB_PROCESSING_QUEUE: &str = "job_processing_queue";
    pub const WORKFLOW_PROCESSING_QUEUE: &str = "workflow_processing_queue";
    pub const DISPATCHER_QUEUE_PREFIX: &str = "dispatcher";
    pub const CONTROLLER_QUEUE_PREFIX: &str = "controller";
    pub const JOB_CONTROLLER: &str = "jobs";
}

/// Scheduling defaults. Every value here can be overridden in configuration.
pub mod defaults {
    use super::Duration;

    pub const DRIVER_INTERVAL: Duration = Duration::from_secs(1);
    pub const ASSIGNMENT_STORAGE_TIMEOUT: Duration = Duration::from_secs(30);
    pub const UPDATE_STORAGE_TIMEOUT: Duration = Duration::from_secs(300);
    pub const TIMEOUT_LIST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const TIMEOUT_BATCH_TIMEOUT: Duration = Duration::from_secs(60);
    pub const TIMEOUT_BATCH_SIZE: usize = 10;
    pub const CASCADE_BATCH_SIZE: usize = 20;
    pub const CLAIM_LIMIT: usize = 100;
    pub const UPDATE_LIMIT: usize = 1000;
    pub const TIMEOUT_LIMIT: usize = 100;
    pub const RETRY_LIMIT: usize = 1000;
    pub const WORKER_HEARTBEAT_WINDOW: Duration = Duration::from_secs(5);
    pub const QUEUE_ACTIVE_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
    pub const CLEANUP_BATCH_SIZE: i64 = 1000;
    pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

    pub const BUFFER_MAX_CONCURRENT_FLUSHES: usize = 50;
    pub const BUFFER_FLUSH_WAIT: Duration = Duration::from_millis(1);
    pub const BUFFER_ENQUEUE_WAIT: Duration = Duration::from_secs(5);
    pub const BUFFER_CEILING_MULTIPLIER: usize = 50;
    pub const BUFFER_BACKLOG_WARN_MULTIPLIER: usize = 10;
    pub const BUFFER_MIN_CHANNEL_SIZE: usize = 100;
}

/// Reason codes attached to failure and cancellation notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// Execution exceeded the step timeout.
    TimedOut,
    /// No worker picked the step run up before its schedule deadline.
    SchedulingTimedOut,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::TimedOut => "TIMED_OUT",
            FailureReason::SchedulingTimedOut => "SCHEDULING_TIMED_OUT",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step run status as stored by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepRunStatus {
    Pending,
    PendingAssignment,
    Assigned,
    Running,
    Succeeded,
    Failed,
    Cancelling,
    Cancelled,
}

impl StepRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepRunStatus::Pending => "PENDING",
            StepRunStatus::PendingAssignment => "PENDING_ASSIGNMENT",
            StepRunStatus::Assigned => "ASSIGNED",
            StepRunStatus::Running => "RUNNING",
            StepRunStatus::Succeeded => "SUCCEEDED",
            StepRunStatus::Failed => "FAILED",
            StepRunStatus::Cancelling => "CANCELLING",
            StepRunStatus::Cancelled => "CANCELLED",
        }
    }

    /// Statuses that remove a step run from the retry queue.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            StepRunStatus::Succeeded
                | StepRunStatus::Failed
                | StepRunStatus::Cancelled
                | StepRunStatus::Cancelling
        )
    }

    /// Statuses that count toward workflow run completion.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepRunStatus::Succeeded | StepRunStatus::Failed | StepRunStatus::Cancelled
        )
    }
}

impl fmt::Display for StepRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(StepRunStatus::Pending),
            "PENDING_ASSIGNMENT" => Ok(StepRunStatus::PendingAssignment),
            "ASSIGNED" => Ok(StepRunStatus::Assigned),
            "RUNNING" => Ok(StepRunStatus::Running),
            "SUCCEEDED" => Ok(StepRunStatus::Succeeded),
            "FAILED" => Ok(StepRunStatus::Failed),
            "CANCELLING" => Ok(StepRunStatus::Cancelling),
            "CANCELLED" => Ok(StepRunStatus::Cancelled),
            other => Err(format!("unknown step run status: {other}")),
        }
    }
}

/// Terminal status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowRunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl WorkflowRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowRunStatus::Succeeded => "SUCCEEDED",
            WorkflowRunStatus::Failed => "FAILED",
            WorkflowRunStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for WorkflowRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCEEDED" => Ok(WorkflowRunStatus::Succeeded),
            "FAILED" => Ok(WorkflowRunStatus::Failed),
            "CANCELLED" => Ok(WorkflowRunStatus::Cancelled),
            other => Err(format!("unknown workflow run status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_codes() {
        assert_eq!(FailureReason::TimedOut.as_str(), "TIMED_OUT");
        assert_eq!(
            FailureReason::SchedulingTimedOut.to_string(),
            "SCHEDULING_TIMED_OUT"
        );
        assert_eq!(
            serde_json::to_string(&FailureReason::SchedulingTimedOut).unwrap(),
            "\"SCHEDULING_TIMED_OUT\""
        );
    }

    #[test]
    fn test_step_run_status_groups() {
        assert!(StepRunStatus::Cancelling.is_final());
        assert!(!StepRunStatus::Cancelling.is_terminal());
        assert!(StepRunStatus::Succeeded.is_terminal());
        assert!(!StepRunStatus::Running.is_final());
        assert_eq!("RUNNING".parse::<StepRunStatus>(), Ok(StepRunStatus::Running));
        assert!("BOGUS".parse::<StepRunStatus>().is_err());
    }
}
