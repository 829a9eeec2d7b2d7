//! Retry reaper: pops elapsed retry entries whose step run is still live and
//! hands each one back to the job controller with `step-run-retry`.

use super::with_timeout;
use crate::config::QueueConfig;
use crate::error::SchedulerResult;
use crate::logging::QUEUE_LOG_TARGET;
use crate::messaging::{MessageQueue, QueueMessage, QueueType};
use crate::storage::StorageEngine;
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

pub struct RetryReaper {
    storage: Arc<dyn StorageEngine>,
    transport: Arc<dyn MessageQueue>,
    config: QueueConfig,
}

impl RetryReaper {
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

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn process_step_run_retries(&self, tenant_id: Uuid) -> SchedulerResult<bool> {
        let reaped = with_timeout(
            "list step runs to retry",
            self.config.timeout_list_timeout(),
            self.storage
                .list_step_runs_to_retry(tenant_id, self.config.retry_limit),
        )
        .await
        .map_err(|e| e.context("could not list step runs to retry"))?;

        if !reaped.items.is_empty() {
            info!(
                target: QUEUE_LOG_TARGET,
                tenant_id = %tenant_id,
                count = reaped.items.len(),
                "Retrying step runs"
            );
        }

        for step_run in &reaped.items {
            let sent = async {
                let message = QueueMessage::step_run_retry(step_run)?;
                self.transport
                    .add_message(&QueueType::JobProcessing, message)
                    .await
            }
            .await;

            if let Err(e) = sent {
                error!(
                    target: QUEUE_LOG_TARGET,
                    step_run_id = %step_run.id,
                    error = %e,
                    "Could not send step run retry"
                );
            }
        }

        Ok(reaped.should_continue)
    }
}
