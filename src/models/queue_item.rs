//! # Queue Items
//!
//! The four queue-like tables the scheduler drains. Every entry carries a
//! `queued` flag that flips from `true` to `false` exactly once when the
//! entry is claimed.

use crate::error::{SchedulerError, SchedulerResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Queue priority (1=Low, 2=Normal, 3=High, 4=Urgent). Higher drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct Priority(i32);

impl Priority {
    pub const LOW: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(2);
    pub const HIGH: Priority = Priority(3);
    pub const URGENT: Priority = Priority(4);

    pub const MIN: i32 = 1;
    pub const MAX: i32 = 4;

    pub fn new(value: i32) -> SchedulerResult<Self> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(SchedulerError::Validation(format!(
                "priority must be between {} and {}, got {value}",
                Self::MIN,
                Self::MAX
            )))
        }
    }

    pub fn value(&self) -> i32 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::LOW
    }
}

impl TryFrom<i32> for Priority {
    type Error = SchedulerError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Priority::new(value)
    }
}

impl From<Priority> for i32 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Constraint on which worker may run a step run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StickyStrategy {
    /// Only the desired worker may run it.
    Hard,
    /// Prefer the desired worker, fall back to any eligible worker.
    Soft,
}

impl StickyStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            StickyStrategy::Hard => "HARD",
            StickyStrategy::Soft => "SOFT",
        }
    }
}

impl FromStr for StickyStrategy {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HARD" => Ok(StickyStrategy::Hard),
            "SOFT" => Ok(StickyStrategy::Soft),
            other => Err(SchedulerError::Validation(format!(
                "unknown sticky strategy: {other}"
            ))),
        }
    }
}

/// One unit of dispatchable work in the ready queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub tenant_id: Uuid,
    pub queue: String,
    pub priority: Priority,
    pub step_run_id: Uuid,
    pub action_id: String,
    pub schedule_timeout_at: Option<DateTime<Utc>>,
    /// Step timeout as written by the workflow definition (e.g. `"60s"`)
    pub step_timeout: Option<String>,
    pub desired_worker_id: Option<Uuid>,
    pub sticky: Option<StickyStrategy>,
    pub queued: bool,
}

impl QueueItem {
    /// True once the schedule deadline has passed without an assignment.
    pub fn is_scheduling_expired(&self, now: DateTime<Utc>) -> bool {
        self.schedule_timeout_at
            .map(|deadline| deadline <= now)
            .unwrap_or(false)
    }
}

/// Insert form of [`QueueItem`]; the id and `queued` flag are assigned by storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewQueueItem {
    pub tenant_id: Uuid,
    pub queue: String,
    pub priority: Priority,
    pub step_run_id: Uuid,
    pub action_id: String,
    pub schedule_timeout_at: Option<DateTime<Utc>>,
    pub step_timeout: Option<String>,
    pub desired_worker_id: Option<Uuid>,
    pub sticky: Option<StickyStrategy>,
}

impl NewQueueItem {
    pub fn new(
        tenant_id: Uuid,
        queue: impl Into<String>,
        step_run_id: Uuid,
        action_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            queue: queue.into(),
            priority: Priority::default(),
            step_run_id,
            action_id: action_id.into(),
            schedule_timeout_at: None,
            step_timeout: None,
            desired_worker_id: None,
            sticky: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_schedule_timeout_at(mut self, deadline: DateTime<Utc>) -> Self {
        self.schedule_timeout_at = Some(deadline);
        self
    }

    pub fn with_step_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.step_timeout = Some(timeout.into());
        self
    }

    pub fn with_sticky(mut self, strategy: StickyStrategy, desired_worker_id: Uuid) -> Self {
        self.sticky = Some(strategy);
        self.desired_worker_id = Some(desired_worker_id);
        self
    }

    /// Rough in-memory footprint, used to size write batches.
    pub fn approximate_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.queue.len()
            + self.action_id.len()
            + self.step_timeout.as_ref().map_or(0, String::len)
    }

    pub(crate) fn into_queue_item(self, id: i64) -> QueueItem {
        QueueItem {
            id,
            tenant_id: self.tenant_id,
            queue: self.queue,
            priority: self.priority,
            step_run_id: self.step_run_id,
            action_id: self.action_id,
            schedule_timeout_at: self.schedule_timeout_at,
            step_timeout: self.step_timeout,
            desired_worker_id: self.desired_worker_id,
            sticky: self.sticky,
            queued: true,
        }
    }
}

/// Created when a failed step run is eligible for another attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryQueueItem {
    pub id: i64,
    pub step_run_id: Uuid,
    pub retry_after: DateTime<Utc>,
    pub tenant_id: Uuid,
    pub queued: bool,
}

/// Created when execution starts; removed on completion, reaped on expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutQueueItem {
    pub id: i64,
    pub step_run_id: Uuid,
    pub retry_count: i32,
    pub timeout_at: DateTime<Utc>,
    pub tenant_id: Uuid,
    pub queued: bool,
}

/// Kinds of work carried by the generic internal queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InternalQueue {
    StepRunUpdate,
    StepRunUpdateV2,
    WorkflowRunUpdate,
}

impl InternalQueue {
    pub fn as_str(&self) -> &'static str {
        match self {
            InternalQueue::StepRunUpdate => "STEP_RUN_UPDATE",
            InternalQueue::StepRunUpdateV2 => "STEP_RUN_UPDATE_V2",
            InternalQueue::WorkflowRunUpdate => "WORKFLOW_RUN_UPDATE",
        }
    }
}

impl FromStr for InternalQueue {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STEP_RUN_UPDATE" => Ok(InternalQueue::StepRunUpdate),
            "STEP_RUN_UPDATE_V2" => Ok(InternalQueue::StepRunUpdateV2),
            "WORKFLOW_RUN_UPDATE" => Ok(InternalQueue::WorkflowRunUpdate),
            other => Err(SchedulerError::Validation(format!(
                "unknown internal queue: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalQueueItem {
    pub id: i64,
    pub tenant_id: Uuid,
    pub queue: InternalQueue,
    pub priority: Priority,
    /// Deduplication key; a second insert with the same key is ignored while queued
    pub unique_key: Option<String>,
    pub data: serde_json::Value,
    pub queued: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInternalQueueItem {
    pub tenant_id: Uuid,
    pub queue: InternalQueue,
    pub priority: Priority,
    pub unique_key: Option<String>,
    pub data: serde_json::Value,
}
