//! Buffered bulk inserts of ready-queue entries.

use super::{BatchBuffer, BatchBufferOptions, BufferShutdown};
use crate::config::BufferConfig;
use crate::error::SchedulerResult;
use crate::models::NewQueueItem;
use crate::storage::StorageEngine;
use std::sync::Arc;

/// Coalesces single queue-item inserts into `create_queue_items_bulk` calls.
pub struct QueueItemWriter {
    buffer: BatchBuffer<NewQueueItem, i64>,
    shutdown: BufferShutdown<NewQueueItem, i64>,
}

impl QueueItemWriter {
    /// Build and start the writer.
    pub fn start(storage: Arc<dyn StorageEngine>, config: &BufferConfig) -> SchedulerResult<Self> {
        let options = BatchBufferOptions::new(
            "queue-item-writer",
            config.queue_item_capacity,
            config.queue_item_max_bytes,
            config.queue_item_flush_period(),
            move |items: Vec<NewQueueItem>| {
                let storage = Arc::clone(&storage);
                async move { storage.create_queue_items_bulk(items).await }
            },
            NewQueueItem::approximate_size,
        )
        .with_buffer_config(config);

        let buffer = BatchBuffer::new(options)?;
        let shutdown = buffer.start()?;
        Ok(Self { buffer, shutdown })
    }

    /// Insert one entry; resolves with its id once its batch is written.
    pub async fn write(&self, item: NewQueueItem) -> SchedulerResult<i64> {
        self.buffer.enqueue(item).await?.await
    }

    pub fn buffer(&self) -> &BatchBuffer<NewQueueItem, i64> {
        &self.buffer
    }

    /// Flush whatever is still buffered and stop.
    pub async fn shutdown(self) -> SchedulerResult<()> {
        self.shutdown.shutdown().await
    }
}
