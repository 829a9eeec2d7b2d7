//! Cancellation tokens for running step runs.
//!
//! A token is inserted when a step run starts and removed when it finishes;
//! cancelling a step run that is not running is an error. [`Registration`]
//! ties the removal to scope exit, so a panicking action cannot leak its
//! entry.

use crate::error::{SchedulerError, SchedulerResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::watch;
use uuid::Uuid;

/// Observer side of one step run's cancellation signal.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    receiver: watch::Receiver<bool>,
}

impl CancellationToken {
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once cancelled. Never resolves if the registry entry is
    /// dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug, Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running step run. Re-inserting replaces the previous token.
    pub fn insert(&self, step_run_id: Uuid) -> CancellationToken {
        let (sender, receiver) = watch::channel(false);
        self.tokens.lock().insert(step_run_id, sender);
        CancellationToken { receiver }
    }

    /// Insert a token that is removed again when the registration drops.
    pub fn register(&self, step_run_id: Uuid) -> Registration<'_> {
        let token = self.insert(step_run_id);
        Registration {
            registry: self,
            step_run_id,
            token,
        }
    }

    pub fn remove(&self, step_run_id: Uuid) {
        self.tokens.lock().remove(&step_run_id);
    }

    pub fn cancel(&self, step_run_id: Uuid) -> SchedulerResult<()> {
        let tokens = self.tokens.lock();
        let sender = tokens.get(&step_run_id).ok_or_else(|| {
            SchedulerError::Worker(format!("could not find step run {step_run_id} to cancel"))
        })?;
        sender.send_replace(true);
        Ok(())
    }

    pub fn contains(&self, step_run_id: Uuid) -> bool {
        self.tokens.lock().contains_key(&step_run_id)
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}

/// Scoped entry in a [`CancellationRegistry`].
#[derive(Debug)]
pub struct Registration<'a> {
    registry: &'a CancellationRegistry,
    step_run_id: Uuid,
    token: CancellationToken,
}

impl Registration<'_> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.remove(self.step_run_id);
    }
}
