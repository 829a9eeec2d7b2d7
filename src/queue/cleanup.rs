//! # Queue Cleaner
//!
//! Deletes processed (`queued = false`) rows from the four queue tables of a
//! tenant, walking each table's processed id range in windows of
//! `cleanup_batch_size` so no single delete holds locks for long.

use super::with_timeout;
use crate::config::QueueConfig;
use crate::error::{ErrorAggregator, SchedulerResult};
use crate::logging::QUEUE_LOG_TARGET;
use crate::storage::{QueueTable, StorageEngine};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Rows deleted per table in one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: BTreeMap<&'static str, u64>,
}

impl CleanupReport {
    pub fn total(&self) -> u64 {
        self.deleted.values().sum()
    }
}

pub struct QueueCleaner {
    storage: Arc<dyn StorageEngine>,
    config: QueueConfig,
}

impl QueueCleaner {
    pub fn new(storage: Arc<dyn StorageEngine>, config: QueueConfig) -> Self {
        Self { storage, config }
    }

    /// Clean every queue table. A failing table does not stop the others.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn cleanup_queue_items(&self, tenant_id: Uuid) -> SchedulerResult<CleanupReport> {
        let mut report = CleanupReport::default();
        let mut errors = ErrorAggregator::new();

        for table in QueueTable::ALL {
            let cleaned = with_timeout(
                "cleanup queue items",
                self.config.update_timeout(),
                self.cleanup_table(tenant_id, table),
            )
            .await
            .map_err(|e| e.context(&format!("could not clean up {table}")));

            if let Some(deleted) = errors.record(cleaned) {
                report.deleted.insert(table.table_name(), deleted);
            }
        }

        if report.total() > 0 {
            info!(
                target: QUEUE_LOG_TARGET,
                tenant_id = %tenant_id,
                deleted = report.total(),
                "Cleaned up processed queue items"
            );
        }

        errors.into_result().map(|()| report)
    }

    async fn cleanup_table(&self, tenant_id: Uuid, table: QueueTable) -> SchedulerResult<u64> {
        let Some(range) = self.storage.get_min_max_processed(tenant_id, table).await? else {
            return Ok(0);
        };

        let batch = self.config.cleanup_batch_size.max(1);
        let mut deleted = 0;
        let mut start = range.min_id;

        while start <= range.max_id {
            let end = start.saturating_add(batch - 1).min(range.max_id);
            deleted += self
                .storage
                .cleanup_processed(tenant_id, table, start, end)
                .await?;
            debug!(
                target: QUEUE_LOG_TARGET,
                table = %table,
                min_id = start,
                max_id = end,
                "Cleaned processed window"
            );

            match end.checked_add(1) {
                Some(next) => start = next,
                None => break,
            }
        }

        Ok(deleted)
    }
}
