//! # In-Memory Message Queue
//!
//! Thread-safe in-memory transport for testing and development.
//!
//! ## Features
//!
//! - **History**: every published message is recorded per queue for assertions
//! - **Single consumer**: each queue has one unbounded channel; a second
//!   concurrent subscriber is rejected
//! - **Redelivery**: a failed delivery is re-sent with one fewer retry
//! - **Failure injection**: `fail_next_sends` makes publishes fail

use super::transport::{MessageHandler, MessageQueue, Subscription};
use super::{QueueMessage, QueueType};
use crate::error::{SchedulerError, SchedulerResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

#[derive(Debug)]
struct InMemoryQueue {
    sender: mpsc::UnboundedSender<QueueMessage>,
    /// Taken by the active subscriber and handed back on unsubscribe
    receiver: Option<mpsc::UnboundedReceiver<QueueMessage>>,
    history: Vec<QueueMessage>,
}

impl InMemoryQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
            history: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    queues: HashMap<String, InMemoryQueue>,
    failing_sends: usize,
    total_sent: u64,
}

impl InMemoryState {
    fn queue(&mut self, name: &str) -> &mut InMemoryQueue {
        self.queues
            .entry(name.to_string())
            .or_insert_with(InMemoryQueue::new)
    }
}

/// In-memory transport
#[derive(Debug, Clone, Default)]
pub struct InMemoryMessageQueue {
    inner: Arc<Mutex<InMemoryState>>,
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published to `queue`, in publish order.
    pub fn messages(&self, queue: &QueueType) -> Vec<QueueMessage> {
        self.inner
            .lock()
            .queues
            .get(&queue.name())
            .map(|q| q.history.clone())
            .unwrap_or_default()
    }

    pub fn messages_with_id(&self, queue: &QueueType, id: &str) -> Vec<QueueMessage> {
        self.messages(queue)
            .into_iter()
            .filter(|m| m.id == id)
            .collect()
    }

    pub fn total_sent(&self) -> u64 {
        self.inner.lock().total_sent
    }

    pub fn clear_history(&self) {
        for queue in self.inner.lock().queues.values_mut() {
            queue.history.clear();
        }
    }

    /// Fail the next `count` publishes with a messaging error.
    pub fn fail_next_sends(&self, count: usize) {
        self.inner.lock().failing_sends = count;
    }
}

async fn deliver(
    handler: &MessageHandler,
    sender: &mpsc::UnboundedSender<QueueMessage>,
    queue: &str,
    message: QueueMessage,
) {
    let retry = message.clone();
    match handler(message).await {
        Ok(()) => {}
        Err(e) if retry.retries > 0 => {
            warn!(queue = %queue, message_id = %retry.id, error = %e, "Handler failed, redelivering");
            let mut retry = retry;
            retry.retries -= 1;
            let _ = sender.send(retry);
        }
        Err(e) => {
            error!(queue = %queue, message_id = %retry.id, error = %e, "Handler failed, dropping message");
        }
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn add_message(&self, queue: &QueueType, message: QueueMessage) -> SchedulerResult<()> {
        let mut state = self.inner.lock();
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(SchedulerError::Messaging(format!(
                "injected send failure on {queue}"
            )));
        }

        state.total_sent += 1;
        let entry = state.queue(&queue.name());
        entry.history.push(message.clone());
        // The receiver lives in the map or in a subscriber task, so this cannot fail.
        let _ = entry.sender.send(message);
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &QueueType,
        handler: MessageHandler,
    ) -> SchedulerResult<Subscription> {
        let name = queue.name();
        let (mut receiver, sender) = {
            let mut state = self.inner.lock();
            let entry = state.queue(&name);
            let receiver = entry.receiver.take().ok_or_else(|| {
                SchedulerError::Messaging(format!("queue {name} already has a subscriber"))
            })?;
            (receiver, entry.sender.clone())
        };

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let queue_name = name.clone();

        let task = tokio::spawn(async move {
            debug!(queue = %queue_name, "In-memory subscriber started");
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    next = receiver.recv() => match next {
                        Some(message) => deliver(&handler, &sender, &queue_name, message).await,
                        None => break,
                    },
                }
            }

            if let Some(entry) = inner.lock().queues.get_mut(&queue_name) {
                entry.receiver = Some(receiver);
            }
            debug!(queue = %queue_name, "In-memory subscriber stopped");
        });

        Ok(Subscription::new(name, shutdown_tx, task))
    }
}
