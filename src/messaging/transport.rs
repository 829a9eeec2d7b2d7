//! # Message Transport
//!
//! Narrow transport abstraction: publish a message to a logical queue, or
//! subscribe a handler to one. Handler failures are redelivered while the
//! message still has retries left, then dropped with an error log.

use super::{QueueMessage, QueueType};
use crate::error::{SchedulerError, SchedulerResult};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

pub type MessageHandler =
    Arc<dyn Fn(QueueMessage) -> BoxFuture<'static, SchedulerResult<()>> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(QueueMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SchedulerResult<()>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

#[async_trait]
pub trait MessageQueue: Send + Sync + 'static {
    async fn add_message(&self, queue: &QueueType, message: QueueMessage) -> SchedulerResult<()>;

    /// Start delivering messages from `queue` to `handler` until the returned
    /// subscription is unsubscribed.
    async fn subscribe(
        &self,
        queue: &QueueType,
        handler: MessageHandler,
    ) -> SchedulerResult<Subscription>;
}

/// Handle to a running consumer loop
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn new(queue: String, shutdown: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self {
            queue,
            shutdown,
            task,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stop the consumer loop and wait for the in-flight delivery to finish.
    pub async fn unsubscribe(self) -> SchedulerResult<()> {
        debug!(queue = %self.queue, "Unsubscribing");
        let _ = self.shutdown.send(true);
        self.task.await.map_err(|e| {
            SchedulerError::Messaging(format!("subscriber for {} failed: {e}", self.queue))
        })
    }
}
