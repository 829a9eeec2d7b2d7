//! # Message Structures
//!
//! Envelope carried by every transport plus the typed payloads the queue
//! controller produces and consumes. Payload and metadata travel as JSON
//! objects; the `id` field names the message kind (see
//! [`crate::constants::message_ids`]).

use crate::constants::{message_ids, FailureReason, WorkflowRunStatus};
use crate::error::{SchedulerError, SchedulerResult};
use crate::models::StepRunForEngine;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transport envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Message kind, e.g. `check-tenant-queue`
    pub id: String,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
    /// Redeliveries allowed after a handler failure
    pub retries: u32,
}

impl QueueMessage {
    pub fn new<P, M>(id: &str, payload: &P, metadata: &M, retries: u32) -> SchedulerResult<Self>
    where
        P: Serialize,
        M: Serialize,
    {
        Ok(Self {
            id: id.to_string(),
            payload: serde_json::to_value(payload)?,
            metadata: serde_json::to_value(metadata)?,
            retries,
        })
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> SchedulerResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            SchedulerError::Validation(format!("could not decode {} payload: {e}", self.id))
        })
    }

    pub fn decode_metadata<T: DeserializeOwned>(&self) -> SchedulerResult<T> {
        serde_json::from_value(self.metadata.clone()).map_err(|e| {
            SchedulerError::Validation(format!("could not decode {} metadata: {e}", self.id))
        })
    }

    pub fn check_tenant_queue(tenant_id: Uuid) -> SchedulerResult<Self> {
        Self::new(
            message_ids::CHECK_TENANT_QUEUE,
            &serde_json::json!({}),
            &TenantMetadata { tenant_id },
            0,
        )
    }

    pub fn step_run_assigned(
        tenant_id: Uuid,
        step_run_id: Uuid,
        worker_id: Uuid,
        dispatcher_id: Uuid,
    ) -> SchedulerResult<Self> {
        Self::new(
            message_ids::STEP_RUN_ASSIGNED,
            &StepRunAssignedPayload {
                step_run_id,
                worker_id,
            },
            &DispatcherMetadata {
                tenant_id,
                dispatcher_id,
            },
            0,
        )
    }

    pub fn step_run_cancel(
        tenant_id: Uuid,
        step_run_id: Uuid,
        reason: FailureReason,
    ) -> SchedulerResult<Self> {
        Self::new(
            message_ids::STEP_RUN_CANCEL,
            &StepRunCancelPayload {
                step_run_id,
                cancelled_reason: reason,
            },
            &TenantMetadata { tenant_id },
            3,
        )
    }

    pub fn step_run_failed(
        step_run: &StepRunForEngine,
        reason: FailureReason,
        failed_at: DateTime<Utc>,
    ) -> SchedulerResult<Self> {
        Self::new(
            message_ids::STEP_RUN_FAILED,
            &StepRunFailedPayload {
                step_run_id: step_run.id,
                workflow_run_id: step_run.workflow_run_id,
                reason,
                failed_at,
            },
            &TenantMetadata {
                tenant_id: step_run.tenant_id,
            },
            0,
        )
    }

    pub fn step_run_queued(step_run: &StepRunForEngine) -> SchedulerResult<Self> {
        Self::new(
            message_ids::STEP_RUN_QUEUED,
            &StepRunQueuedPayload {
                step_run_id: step_run.id,
                job_run_id: step_run.job_run_id,
                workflow_run_id: step_run.workflow_run_id,
                action_id: step_run.action_id.clone(),
            },
            &TenantMetadata {
                tenant_id: step_run.tenant_id,
            },
            0,
        )
    }

    pub fn step_run_retry(step_run: &StepRunForEngine) -> SchedulerResult<Self> {
        Self::new(
            message_ids::STEP_RUN_RETRY,
            &StepRunRetryPayload {
                step_run_id: step_run.id,
                job_run_id: step_run.job_run_id,
                retry_count: step_run.retry_count,
            },
            &TenantMetadata {
                tenant_id: step_run.tenant_id,
            },
            0,
        )
    }

    pub fn workflow_run_finished(
        tenant_id: Uuid,
        workflow_run_id: Uuid,
        status: WorkflowRunStatus,
    ) -> SchedulerResult<Self> {
        Self::new(
            message_ids::WORKFLOW_RUN_FINISHED,
            &WorkflowRunFinishedPayload {
                workflow_run_id,
                status,
            },
            &TenantMetadata { tenant_id },
            0,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantMetadata {
    pub tenant_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherMetadata {
    pub tenant_id: Uuid,
    pub dispatcher_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRunAssignedPayload {
    pub step_run_id: Uuid,
    pub worker_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRunCancelPayload {
    pub step_run_id: Uuid,
    pub cancelled_reason: FailureReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRunFailedPayload {
    pub step_run_id: Uuid,
    pub workflow_run_id: Uuid,
    pub reason: FailureReason,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRunQueuedPayload {
    pub step_run_id: Uuid,
    pub job_run_id: Uuid,
    pub workflow_run_id: Uuid,
    pub action_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRunRetryPayload {
    pub step_run_id: Uuid,
    pub job_run_id: Uuid,
    pub retry_count: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRunFinishedPayload {
    pub workflow_run_id: Uuid,
    pub status: WorkflowRunStatus,
}
