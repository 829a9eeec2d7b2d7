//! # Data Models
//!
//! Rust representations of the rows the scheduling core reads and writes:
//! queue entries (ready, retry, timeout and internal), step runs, workers and
//! their slot accounting.

pub mod queue_item;
pub mod step_run;
pub mod worker;

pub use queue_item::{
    InternalQueue, InternalQueueItem, NewInternalQueueItem, NewQueueItem, Priority, QueueItem,
    RetryQueueItem, StickyStrategy, TimeoutQueueItem,
};
pub use step_run::{
    CompletedWorkflowRun, StepRun, StepRunEvent, StepRunForEngine, StepRunUpdate,
};
pub use worker::{SlotClaim, Worker, WorkerSlots};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unit of isolation. A controller partition serves a dynamic subset of tenants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub controller_partition_id: Option<String>,
}

impl Tenant {
    pub fn new(id: Uuid, controller_partition_id: impl Into<String>) -> Self {
        Self {
            id,
            controller_partition_id: Some(controller_partition_id.into()),
        }
    }
}
