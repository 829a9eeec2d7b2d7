//! # Worker Runtime
//!
//! Executes actions assigned to this worker and reports their lifecycle as
//! action events on the worker's event channel.
//!
//! ## Start
//!
//! `started` is emitted before the action runs. The step run is registered
//! with the [`CancellationRegistry`] for the duration of the invocation.
//! A completed run emits `completed` with the JSON-encoded output; a failed
//! or panicking run emits `failed` with the error text. A run that was
//! cancelled while it executed emits nothing further.
//!
//! ## Cancel
//!
//! Signals the running step run's token. The action observes it through
//! [`ActionContext::cancelled`].

use super::action::ActionContext;
use super::cancellation::CancellationRegistry;
use super::registry::ActionRegistry;
use crate::constants::message_ids;
use crate::error::{SchedulerError, SchedulerResult};
use crate::messaging::{MessageQueue, QueueMessage, QueueType, TenantMetadata};
use crate::scheduler::operation_pool::panic_message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use futures::FutureExt;
use serde_json::Value;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignedActionType {
    StartStepRun,
    CancelStepRun,
}

/// Work the dispatcher hands to this worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedAction {
    pub tenant_id: Uuid,
    pub worker_id: Uuid,
    pub step_run_id: Uuid,
    pub action_id: String,
    pub action_type: AssignedActionType,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionEventType {
    Started,
    Completed,
    Failed,
}

impl fmt::Display for ActionEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEvent {
    pub worker_id: Uuid,
    pub step_run_id: Uuid,
    pub action_id: String,
    pub event_type: ActionEventType,
    pub event_timestamp: DateTime<Utc>,
    /// JSON output on completion, error text on failure
    pub event_payload: Option<String>,
}

pub struct WorkerRuntime {
    worker_id: Uuid,
    actions: Arc<ActionRegistry>,
    cancellations: Arc<CancellationRegistry>,
    transport: Arc<dyn MessageQueue>,
}

impl fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("worker_id", &self.worker_id)
            .field("actions", &self.actions)
            .field("running", &self.cancellations.len())
            .finish()
    }
}

impl WorkerRuntime {
    pub fn new(
        worker_id: Uuid,
        actions: Arc<ActionRegistry>,
        transport: Arc<dyn MessageQueue>,
    ) -> Self {
        Self {
            worker_id,
            actions,
            cancellations: Arc::new(CancellationRegistry::new()),
            transport,
        }
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    pub fn cancellations(&self) -> &Arc<CancellationRegistry> {
        &self.cancellations
    }

    pub fn event_queue(&self) -> QueueType {
        QueueType::WorkerEvents(self.worker_id)
    }

    /// Run or cancel an assigned action.
    ///
    /// Returns the action output for a completed start, `None` for a cancel
    /// or for a start that was cancelled mid-run.
    #[instrument(skip(self, action), fields(
        worker_id = %self.worker_id,
        step_run_id = %action.step_run_id,
        action_id = %action.action_id,
    ))]
    pub async fn handle_assigned_action(
        &self,
        action: AssignedAction,
    ) -> SchedulerResult<Option<Value>> {
        if action.worker_id != self.worker_id {
            return Err(SchedulerError::Validation(format!(
                "action for worker {} delivered to worker {}",
                action.worker_id, self.worker_id
            )));
        }

        match action.action_type {
            AssignedActionType::StartStepRun => self.start_step_run(action).await,
            AssignedActionType::CancelStepRun => {
                self.cancellations.cancel(action.step_run_id)?;
                info!("Cancelled step run");
                Ok(None)
            }
        }
    }

    async fn start_step_run(&self, assigned: AssignedAction) -> SchedulerResult<Option<Value>> {
        self.send_event(&assigned, ActionEventType::Started, None)
            .await?;

        let Some(action) = self.actions.get(&assigned.action_id) else {
            let message = format!("action {} is not registered", assigned.action_id);
            self.send_event(&assigned, ActionEventType::Failed, Some(message.clone()))
                .await?;
            return Err(SchedulerError::Worker(message));
        };

        let registration = self.cancellations.register(assigned.step_run_id);
        let token = registration.token().clone();
        let ctx = ActionContext::new(
            assigned.step_run_id,
            assigned.action_id.clone(),
            self.worker_id,
            token.clone(),
        );
        let result = AssertUnwindSafe(action.invoke(ctx, assigned.payload.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(SchedulerError::Worker(format!(
                    "action {} panicked: {}",
                    assigned.action_id,
                    panic_message(panic.as_ref())
                )))
            });
        drop(registration);

        if token.is_cancelled() {
            debug!("Step run cancelled during execution; not reporting result");
            return Ok(None);
        }

        match result {
            Ok(output) => {
                let encoded = serde_json::to_string(&output)?;
                self.send_event(&assigned, ActionEventType::Completed, Some(encoded))
                    .await?;
                Ok(Some(output))
            }
            Err(e) => {
                warn!(error = %e, "Action failed");
                let message = match e {
                    SchedulerError::Worker(message) => message,
                    other => other.to_string(),
                };
                self.send_event(&assigned, ActionEventType::Failed, Some(message.clone()))
                    .await?;
                Err(SchedulerError::Worker(message))
            }
        }
    }

    async fn send_event(
        &self,
        assigned: &AssignedAction,
        event_type: ActionEventType,
        event_payload: Option<String>,
    ) -> SchedulerResult<()> {
        let event = ActionEvent {
            worker_id: self.worker_id,
            step_run_id: assigned.step_run_id,
            action_id: assigned.action_id.clone(),
            event_type,
            event_timestamp: Utc::now(),
            event_payload,
        };
        let message = QueueMessage::new(
            message_ids::ACTION_EVENT,
            &event,
            &TenantMetadata {
                tenant_id: assigned.tenant_id,
            },
            0,
        )?;

        self.transport
            .add_message(&self.event_queue(), message)
            .await
            .map_err(|e| e.context(&format!("could not send {event_type} event")))
    }
}
