//! # PGMQ Message Queue
//!
//! Transport over the `pgmq` PostgreSQL extension, driven through its SQL
//! functions (`pgmq.create`, `pgmq.send`, `pgmq.read`, `pgmq.delete`,
//! `pgmq.archive`) on a shared `sqlx` pool.
//!
//! Delivery is at-least-once: a message is deleted only after its handler
//! succeeds. A failed message becomes visible again after the visibility
//! timeout and is archived once it has been read more than `retries + 1`
//! times.

use super::transport::{MessageHandler, MessageQueue, Subscription};
use super::{QueueMessage, QueueType};
use crate::config::MessagingConfig;
use crate::error::{SchedulerError, SchedulerResult};
use async_trait::async_trait;
use dashmap::DashSet;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, sqlx::FromRow)]
struct PgmqRow {
    msg_id: i64,
    read_ct: i32,
    message: serde_json::Value,
}

/// pgmq-backed transport
#[derive(Debug, Clone)]
pub struct PgmqMessageQueue {
    pool: PgPool,
    config: MessagingConfig,
    created: Arc<DashSet<String>>,
}

impl PgmqMessageQueue {
    pub fn new(pool: PgPool, config: MessagingConfig) -> Self {
        Self {
            pool,
            config,
            created: Arc::new(DashSet::new()),
        }
    }

    /// Create the queue once per process.
    async fn ensure_queue(&self, name: &str) -> SchedulerResult<()> {
        if self.created.contains(name) {
            return Ok(());
        }

        sqlx::query("SELECT pgmq.create($1)")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| SchedulerError::Messaging(format!("Failed to create queue {name}: {e}")))?;

        self.created.insert(name.to_string());
        info!(queue = %name, "Queue ready");
        Ok(())
    }
}

async fn read_batch(
    pool: &PgPool,
    queue: &str,
    visibility_timeout: i32,
    batch_size: i32,
) -> SchedulerResult<Vec<PgmqRow>> {
    sqlx::query_as::<_, PgmqRow>("SELECT msg_id, read_ct, message FROM pgmq.read($1, $2, $3)")
        .bind(queue)
        .bind(visibility_timeout)
        .bind(batch_size)
        .fetch_all(pool)
        .await
        .map_err(|e| SchedulerError::Messaging(format!("Failed to read from {queue}: {e}")))
}

async fn settle(pool: &PgPool, queue: &str, function: &str, msg_id: i64) -> SchedulerResult<()> {
    let query = format!("SELECT pgmq.{function}($1, $2)");
    sqlx::query(&query)
        .bind(queue)
        .bind(msg_id)
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(|e| SchedulerError::Messaging(format!("Failed to {function} message {msg_id}: {e}")))
}

async fn handle_row(pool: &PgPool, queue: &str, handler: &MessageHandler, row: PgmqRow) {
    let message: QueueMessage = match serde_json::from_value(row.message) {
        Ok(message) => message,
        Err(e) => {
            error!(queue = %queue, msg_id = row.msg_id, error = %e, "Archiving undecodable message");
            if let Err(e) = settle(pool, queue, "archive", row.msg_id).await {
                error!(error = %e, "Failed to archive undecodable message");
            }
            return;
        }
    };

    let retries = message.retries;
    let message_id = message.id.clone();
    let outcome = match handler(message).await {
        Ok(()) => settle(pool, queue, "delete", row.msg_id).await,
        Err(e) if (row.read_ct as u32) <= retries => {
            warn!(queue = %queue, msg_id = row.msg_id, message_id = %message_id, error = %e, "Handler failed, message will be redelivered");
            Ok(())
        }
        Err(e) => {
            error!(queue = %queue, msg_id = row.msg_id, message_id = %message_id, error = %e, "Handler failed, archiving message");
            settle(pool, queue, "archive", row.msg_id).await
        }
    };

    if let Err(e) = outcome {
        error!(queue = %queue, error = %e, "Failed to settle message");
    }
}

#[async_trait]
impl MessageQueue for PgmqMessageQueue {
    #[instrument(skip(self, message), fields(queue = %queue, message_id = %message.id))]
    async fn add_message(&self, queue: &QueueType, message: QueueMessage) -> SchedulerResult<()> {
        let name = queue.name();
        self.ensure_queue(&name).await?;

        let body = serde_json::to_value(&message)?;
        let msg_id: i64 = sqlx::query_scalar("SELECT pgmq.send($1, $2::jsonb)")
            .bind(&name)
            .bind(&body)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SchedulerError::Messaging(format!("Failed to send to {name}: {e}")))?;

        debug!(msg_id = msg_id, "Message sent");
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &QueueType,
        handler: MessageHandler,
    ) -> SchedulerResult<Subscription> {
        let name = queue.name();
        self.ensure_queue(&name).await?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let pool = self.pool.clone();
        let poll_interval = self.config.poll_interval();
        let visibility_timeout = self.config.visibility_timeout_seconds;
        let batch_size = self.config.read_batch_size;
        let queue_name = name.clone();

        let task = tokio::spawn(async move {
            info!(queue = %queue_name, "pgmq subscriber started");
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let rows = match read_batch(&pool, &queue_name, visibility_timeout, batch_size).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        error!(queue = %queue_name, error = %e, "Failed to poll queue");
                        Vec::new()
                    }
                };

                if rows.is_empty() {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {}
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                    continue;
                }

                for row in rows {
                    handle_row(&pool, &queue_name, &handler, row).await;
                }
            }
            info!(queue = %queue_name, "pgmq subscriber stopped");
        });

        Ok(Subscription::new(name, shutdown_tx, task))
    }
}
