//! # Tenant Operation Pool
//!
//! Coalescing, single-flight execution of one named operation across a
//! dynamic set of tenants.
//!
//! ## Guarantees
//!
//! - **Single flight**: at most one invocation of the operation runs per
//!   tenant at any time.
//! - **No lost signal**: a `run_or_continue` that arrives while the tenant's
//!   operation is running makes it run again as soon as the current run ends.
//! - **Eviction**: tenants dropped by `set_tenants` lose their pending signal;
//!   signals for unknown tenants are ignored. An evicted tenant whose run is
//!   still in flight keeps its entry until the run ends, so re-adding it
//!   never starts a second invocation beside the first.
//! - **Shutdown**: once `shutdown` starts no run loops again, and it returns
//!   when every in-flight run has finished.
//!
//! A failed (or panicking) run is logged and does not continue on its own;
//! the next driver tick retries it.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tasker_scheduler::scheduler::{operation_fn, OperationPool};
//!
//! # async fn example(tenant_id: uuid::Uuid) {
//! let pool = OperationPool::new(
//!     "check tenant queue",
//!     operation_fn(|tenant_id| async move {
//!         // claim and assign work for `tenant_id`
//!         let _ = tenant_id;
//!         Ok(false)
//!     }),
//! );
//!
//! pool.set_tenants([tenant_id]);
//! pool.run_or_continue(tenant_id);
//! pool.shutdown().await;
//! # }
//! ```

use crate::error::{SchedulerError, SchedulerResult};
use crate::logging::QUEUE_LOG_TARGET;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Bound operation: returns whether the tenant should be processed again
/// immediately.
pub type OperationFn =
    Arc<dyn Fn(Uuid) -> BoxFuture<'static, SchedulerResult<bool>> + Send + Sync>;

/// Wrap an async closure as an [`OperationFn`].
pub fn operation_fn<F, Fut>(f: F) -> OperationFn
where
    F: Fn(Uuid) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SchedulerResult<bool>> + Send + 'static,
{
    Arc::new(move |tenant_id| Box::pin(f(tenant_id)))
}

#[derive(Debug, Default)]
struct OperationState {
    is_running: bool,
    should_continue: bool,
    evicted: bool,
}

/// Per-tenant state machine: idle, running, or running with a rerun queued.
pub struct SerialOperation {
    description: Arc<str>,
    tenant_id: Uuid,
    state: Mutex<OperationState>,
    f: OperationFn,
    shutting_down: Arc<AtomicBool>,
}

impl std::fmt::Debug for SerialOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialOperation")
            .field("description", &self.description)
            .field("tenant_id", &self.tenant_id)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl SerialOperation {
    fn new(
        description: Arc<str>,
        tenant_id: Uuid,
        f: OperationFn,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        Self {
            description,
            tenant_id,
            state: Mutex::new(OperationState::default()),
            f,
            shutting_down,
        }
    }

    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_running
    }

    /// Transition idle to running, or queue a rerun. Returns true when the
    /// caller must start the run loop.
    fn claim_run(&self) -> bool {
        let mut state = self.state.lock();
        if state.evicted {
            return false;
        }
        if state.is_running {
            state.should_continue = true;
            return false;
        }
        state.is_running = true;
        true
    }

    /// Returns true when the tenant was not already evicted.
    fn evict(&self) -> bool {
        let mut state = self.state.lock();
        let newly = !state.evicted;
        state.evicted = true;
        state.should_continue = false;
        newly
    }

    fn restore(&self) {
        self.state.lock().evicted = false;
    }

    fn is_evicted(&self) -> bool {
        self.state.lock().evicted
    }

    /// Evicted with no run in flight: safe to drop from the pool.
    fn is_retired(&self) -> bool {
        let state = self.state.lock();
        state.evicted && !state.is_running
    }

    /// Decide after a run whether to go again; clears the pending signal.
    fn finish_run(&self, continue_now: bool) -> bool {
        let mut state = self.state.lock();
        let rerun = !state.evicted
            && !self.shutting_down.load(Ordering::Acquire)
            && (continue_now || state.should_continue);
        state.should_continue = false;
        if !rerun {
            state.is_running = false;
        }
        rerun
    }

    async fn invoke(&self) -> SchedulerResult<bool> {
        match AssertUnwindSafe((self.f)(self.tenant_id)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(SchedulerError::Internal(format!(
                "operation panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            let started = Instant::now();
            let continue_now = match self.invoke().await {
                Ok(continue_now) => continue_now,
                Err(e) => {
                    error!(
                        target: QUEUE_LOG_TARGET,
                        operation = %self.description,
                        tenant_id = %self.tenant_id,
                        error = %e,
                        "Operation failed"
                    );
                    false
                }
            };

            debug!(
                target: QUEUE_LOG_TARGET,
                operation = %self.description,
                tenant_id = %self.tenant_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                continue_now = continue_now,
                "Operation run finished"
            );

            if !self.finish_run(continue_now) {
                break;
            }
            // Let the driver and other tenants in between back-to-back runs
            tokio::task::yield_now().await;
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// One named operation over every tenant known to this controller partition.
pub struct OperationPool {
    description: Arc<str>,
    f: OperationFn,
    operations: Arc<DashMap<Uuid, Arc<SerialOperation>>>,
    tasks: Mutex<JoinSet<()>>,
    shutting_down: Arc<AtomicBool>,
}

impl std::fmt::Debug for OperationPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationPool")
            .field("description", &self.description)
            .field("tenants", &self.tenant_count())
            .finish()
    }
}

impl OperationPool {
    pub fn new(description: impl Into<String>, f: OperationFn) -> Self {
        let description: String = description.into();
        Self {
            description: Arc::from(description),
            f,
            operations: Arc::new(DashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Replace the known tenant set.
    pub fn set_tenants(&self, tenants: impl IntoIterator<Item = Uuid>) {
        let wanted: HashSet<Uuid> = tenants.into_iter().collect();

        self.operations.retain(|tenant_id, operation| {
            if wanted.contains(tenant_id) {
                return true;
            }
            if operation.evict() {
                debug!(
                    target: QUEUE_LOG_TARGET,
                    operation = %self.description,
                    tenant_id = %tenant_id,
                    "Tenant evicted from pool"
                );
            }
            // A running entry is dropped by its run loop once the run ends
            operation.is_running()
        });

        for tenant_id in wanted {
            match self.operations.entry(tenant_id) {
                Entry::Occupied(entry) => entry.get().restore(),
                Entry::Vacant(entry) => {
                    entry.insert(Arc::new(SerialOperation::new(
                        Arc::clone(&self.description),
                        tenant_id,
                        Arc::clone(&self.f),
                        Arc::clone(&self.shutting_down),
                    )));
                }
            }
        }
    }

    /// Start the tenant's operation, or request a rerun if it is running.
    /// Never blocks on the operation itself.
    pub fn run_or_continue(&self, tenant_id: Uuid) {
        let Some(operation) = self
            .operations
            .get(&tenant_id)
            .map(|entry| Arc::clone(entry.value()))
        else {
            debug!(
                target: QUEUE_LOG_TARGET,
                operation = %self.description,
                tenant_id = %tenant_id,
                "Ignoring signal for unknown tenant"
            );
            return;
        };

        // The flag is flipped under this lock, so no run escapes `shutdown`
        let mut tasks = self.tasks.lock();
        if self.shutting_down.load(Ordering::Acquire) || !operation.claim_run() {
            return;
        }
        while tasks.try_join_next().is_some() {}

        let operations = Arc::clone(&self.operations);
        tasks.spawn(async move {
            Arc::clone(&operation).run_loop().await;
            operations.remove_if(&tenant_id, |_, current| {
                Arc::ptr_eq(current, &operation) && current.is_retired()
            });
        });
    }

    /// Known tenants, not counting evicted ones still finishing a run.
    pub fn tenant_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|entry| !entry.value().is_evicted())
            .count()
    }

    pub fn contains(&self, tenant_id: Uuid) -> bool {
        self.operations
            .get(&tenant_id)
            .map(|operation| !operation.is_evicted())
            .unwrap_or(false)
    }

    pub fn is_running(&self, tenant_id: Uuid) -> bool {
        self.operations
            .get(&tenant_id)
            .map(|operation| operation.is_running())
            .unwrap_or(false)
    }

    /// Stop accepting signals and wait for every detached run to finish.
    pub async fn shutdown(&self) {
        let mut tasks = {
            let mut tasks = self.tasks.lock();
            self.shutting_down.store(true, Ordering::Release);
            std::mem::take(&mut *tasks)
        };

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(
                    target: QUEUE_LOG_TARGET,
                    operation = %self.description,
                    error = %e,
                    "Operation task did not finish cleanly"
                );
            }
        }
    }
}
