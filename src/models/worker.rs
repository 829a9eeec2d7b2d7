//! Workers and slot accounting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// Dispatcher the worker is connected through; unset while disconnected
    pub dispatcher_id: Option<Uuid>,
    pub max_runs: i32,
    pub last_heartbeat_at: DateTime<Utc>,
    pub is_active: bool,
    pub is_paused: bool,
    /// Action ids this worker has registered
    pub actions: Vec<String>,
}

impl Worker {
    pub fn new(tenant_id: Uuid, dispatcher_id: Uuid, max_runs: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            dispatcher_id: Some(dispatcher_id),
            max_runs,
            last_heartbeat_at: Utc::now(),
            is_active: true,
            is_paused: false,
            actions: Vec::new(),
        }
    }

    pub fn with_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions = actions.into_iter().map(Into::into).collect();
        self
    }

    /// Eligible for assignment: connected, active, not paused, and heartbeating
    /// within `heartbeat_window`.
    pub fn is_eligible(&self, now: DateTime<Utc>, heartbeat_window: Duration) -> bool {
        let window = chrono::Duration::from_std(heartbeat_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(5));

        self.dispatcher_id.is_some()
            && self.is_active
            && !self.is_paused
            && self.last_heartbeat_at > now - window
    }

    pub fn handles(&self, action_id: &str) -> bool {
        self.actions.iter().any(|action| action == action_id)
    }
}

/// Remaining capacity of one eligible worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSlots {
    pub worker_id: Uuid,
    pub dispatcher_id: Uuid,
    /// `max_runs` minus current slot claims, never negative
    pub available_slots: i32,
    pub actions: Vec<String>,
}

impl WorkerSlots {
    pub fn handles(&self, action_id: &str) -> bool {
        self.actions.iter().any(|action| action == action_id)
    }
}

/// One unit of consumed worker capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotClaim {
    pub worker_id: Uuid,
    pub step_run_id: Uuid,
}
