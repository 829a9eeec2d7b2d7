//! # Timeout Reaper
//!
//! Pops expired timeout entries for one tenant and reports each step run as
//! failed with `TIMED_OUT`. Storage consumes the entries in the same call,
//! so an entry is reaped exactly once even if its deadline stays in the past.
//!
//! Every failure in one sweep carries the same `failed_at`. Notifications
//! go out in fixed-size batches, each bounded by the batch timeout; a failed
//! or timed-out send is logged and the sweep carries on.

use super::with_timeout;
use crate::config::QueueConfig;
use crate::constants::FailureReason;
use crate::error::SchedulerResult;
use crate::logging::QUEUE_LOG_TARGET;
use crate::messaging::{MessageQueue, QueueMessage, QueueType};
use crate::scheduler::make_batched;
use crate::storage::StorageEngine;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub struct TimeoutReaper {
    storage: Arc<dyn StorageEngine>,
    transport: Arc<dyn MessageQueue>,
    config: QueueConfig,
}

impl TimeoutReaper {
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

    /// Reap and notify. Returns whether more expired entries remain.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn process_step_run_timeouts(&self, tenant_id: Uuid) -> SchedulerResult<bool> {
        let reaped = with_timeout(
            "list step runs to timeout",
            self.config.timeout_list_timeout(),
            self.storage
                .list_step_runs_to_timeout(tenant_id, self.config.timeout_limit),
        )
        .await
        .map_err(|e| {
            e.context(&format!(
                "could not list step runs to timeout for tenant {tenant_id}"
            ))
        })?;

        if reaped.items.is_empty() {
            return Ok(reaped.should_continue);
        }

        info!(
            target: QUEUE_LOG_TARGET,
            tenant_id = %tenant_id,
            count = reaped.items.len(),
            "Timing out step runs"
        );

        let failed_at = Utc::now();
        let batch_timeout = self.config.timeout_batch_timeout();

        make_batched(self.config.timeout_batch_size, reaped.items, |group| async move {
            let send_all = async {
                for step_run in &group {
                    let sent = async {
                        let message = QueueMessage::step_run_failed(
                            step_run,
                            FailureReason::TimedOut,
                            failed_at,
                        )?;
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
                            "Could not add step run failed task to task queue"
                        );
                    }
                }
            };

            if tokio::time::timeout(batch_timeout, send_all).await.is_err() {
                warn!(
                    target: QUEUE_LOG_TARGET,
                    tenant_id = %tenant_id,
                    batch_size = group.len(),
                    timeout_ms = batch_timeout.as_millis() as u64,
                    "Timed out sending step run timeout notifications"
                );
            }
            Ok(())
        })
        .await
        .map_err(|e| e.context("could not process step run timeouts"))?;

        Ok(reaped.should_continue)
    }
}
