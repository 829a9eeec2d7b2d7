//! Explicit action registry: action id to implementation.
//!
//! Actions registered through a service are namespaced `service:action`;
//! the id is what queue entries carry as their action id.

use super::action::Action;
use crate::error::{SchedulerError, SchedulerResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
pub struct ActionRegistry {
    actions: Mutex<HashMap<String, Arc<dyn Action>>>,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.action_ids())
            .finish()
    }
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the action's own name.
    pub fn register(&self, action: Arc<dyn Action>) -> SchedulerResult<()> {
        let id = action.name().to_string();
        self.insert(id, action)
    }

    /// Register under `service:name`.
    pub fn register_in_service(&self, service: &str, action: Arc<dyn Action>) -> SchedulerResult<()> {
        let id = format!("{service}:{}", action.name());
        self.insert(id, action)
    }

    fn insert(&self, id: String, action: Arc<dyn Action>) -> SchedulerResult<()> {
        let mut actions = self.actions.lock();
        if actions.contains_key(&id) {
            return Err(SchedulerError::Worker(format!("action {id} already registered")));
        }
        debug!(action_id = %id, "Registered action");
        actions.insert(id, action);
        Ok(())
    }

    pub fn get(&self, action_id: &str) -> Option<Arc<dyn Action>> {
        self.actions.lock().get(action_id).cloned()
    }

    /// Registered ids, sorted; what the worker advertises to its dispatcher.
    pub fn action_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.actions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.actions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.lock().is_empty()
    }
}
