//! Fixture builders over the in-memory storage engine and transport.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tasker_scheduler::config::{QueueConfig, SchedulerConfig};
use tasker_scheduler::messaging::{InMemoryMessageQueue, MessageQueue, QueueMessage, QueueType};
use tasker_scheduler::models::{
    InternalQueue, NewQueueItem, Priority, StepRun, StepRunEvent, StepRunUpdate, Tenant, Worker,
};
use tasker_scheduler::storage::{InMemoryStorage, StorageEngine};
use uuid::Uuid;

pub const PARTITION: &str = "test-partition";

/// One tenant on [`PARTITION`] with its own storage and transport.
pub struct TenantFixture {
    pub tenant_id: Uuid,
    pub storage: Arc<InMemoryStorage>,
    pub transport: Arc<InMemoryMessageQueue>,
}

impl TenantFixture {
    pub fn new() -> Self {
        let storage = Arc::new(InMemoryStorage::new());
        let tenant_id = Uuid::new_v4();
        storage.add_tenant(Tenant::new(tenant_id, PARTITION));

        Self {
            tenant_id,
            storage,
            transport: Arc::new(InMemoryMessageQueue::new()),
        }
    }

    pub fn storage_engine(&self) -> Arc<dyn StorageEngine> {
        self.storage.clone()
    }

    pub fn message_queue(&self) -> Arc<dyn MessageQueue> {
        self.transport.clone()
    }

    /// Add a heartbeating worker that handles `actions`.
    pub fn worker(&self, max_runs: i32, actions: &[&str]) -> Worker {
        let worker =
            Worker::new(self.tenant_id, Uuid::new_v4(), max_runs).with_actions(actions.iter().copied());
        self.storage.upsert_worker(worker.clone());
        worker
    }

    /// Insert a pending step run with no parents.
    pub fn step_run(&self, workflow_run_id: Uuid, job_run_id: Uuid, action_id: &str) -> StepRun {
        let step_run = StepRun::new(self.tenant_id, workflow_run_id, job_run_id, action_id);
        self.storage.insert_step_run(step_run.clone());
        step_run
    }

    pub fn child_of(&self, parents: &[&StepRun], action_id: &str) -> StepRun {
        let first = parents[0];
        let step_run = StepRun::new(self.tenant_id, first.workflow_run_id, first.job_run_id, action_id)
            .with_parents(parents.iter().map(|p| p.id).collect());
        self.storage.insert_step_run(step_run.clone());
        step_run
    }

    /// Queue a ready entry for a fresh step run; returns (queue item id, step run id).
    pub async fn enqueue(&self, action_id: &str, priority: i32) -> (i64, Uuid) {
        self.enqueue_item(
            NewQueueItem::new(self.tenant_id, "default", Uuid::new_v4(), action_id)
                .with_priority(Priority::new(priority).unwrap()),
        )
        .await
    }

    pub async fn enqueue_item(&self, item: NewQueueItem) -> (i64, Uuid) {
        let step_run_id = item.step_run_id;
        let ids = self.storage.create_queue_items_bulk(vec![item]).await.unwrap();
        (ids[0], step_run_id)
    }

    pub fn record(&self, step_run_id: Uuid, event: StepRunEvent, queue: InternalQueue) {
        self.storage
            .record_step_run_update(self.tenant_id, StepRunUpdate::new(step_run_id, event), queue)
            .unwrap();
    }

    pub fn succeed(&self, step_run_id: Uuid, queue: InternalQueue) {
        self.record(step_run_id, StepRunEvent::Succeeded { output: None }, queue);
    }

    pub async fn expire_timeout(&self, step_run_id: Uuid) -> i64 {
        self.storage
            .create_timeout_queue_item(
                self.tenant_id,
                step_run_id,
                0,
                Utc::now() - ChronoDuration::seconds(1),
            )
            .await
            .unwrap()
    }

    pub fn messages(&self, queue: &QueueType, id: &str) -> Vec<QueueMessage> {
        self.transport.messages_with_id(queue, id)
    }
}

impl Default for TenantFixture {
    fn default() -> Self {
        Self::new()
    }
}

pub fn queue_config() -> QueueConfig {
    QueueConfig::default()
}

pub fn scheduler_config() -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    config.controller.partition_id = PARTITION.to_string();
    config.controller.driver_interval_ms = 50;
    config
}
