//! # Queue Controller
//!
//! Binds every per-tenant queue operation to its own
//! [`OperationPool`] and drives the pools.
//!
//! ## Drivers
//!
//! One fixed-interval driver per pool. Each tick lists the tenants of this
//! controller's partition, replaces the pool's tenant set, and signals every
//! tenant. Ticks never wait on the operations themselves; a failed tenant
//! listing skips the tick.
//!
//! ## Partition channel
//!
//! The controller subscribes to its partition queue. `check-tenant-queue`
//! messages nudge the assignment pool and both update pools for that tenant
//! without waiting for the next tick. Any other message id is rejected, and a
//! panic in the handler is returned as an error instead of unwinding into the
//! subscriber.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tasker_scheduler::config::SchedulerConfig;
//! use tasker_scheduler::messaging::InMemoryMessageQueue;
//! use tasker_scheduler::queue::QueueController;
//! use tasker_scheduler::storage::InMemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let controller = QueueController::new(
//!     Arc::new(InMemoryStorage::new()),
//!     Arc::new(InMemoryMessageQueue::new()),
//!     &SchedulerConfig::default(),
//! )?;
//!
//! let handle = controller.start().await?;
//! // ... serve until asked to stop
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use super::{
    with_timeout, QueueAssignmentEngine, QueueCleaner, RetryReaper, TimeoutReaper,
    UpdateCascadeProcessor, UpdateStrategy,
};
use crate::config::{ControllerConfig, SchedulerConfig};
use crate::constants::message_ids;
use crate::error::{ErrorAggregator, SchedulerError, SchedulerResult};
use crate::logging::QUEUE_LOG_TARGET;
use crate::messaging::{handler_fn, MessageQueue, QueueMessage, QueueType, Subscription, TenantMetadata};
use crate::scheduler::operation_pool::panic_message;
use crate::scheduler::{operation_fn, OperationFn, OperationPool};
use crate::storage::StorageEngine;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// The operations driven by the controller, one pool each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerOperation {
    CheckTenantQueue,
    UpdateStepRuns,
    UpdateStepRunsV2,
    TimeoutStepRuns,
    RetryStepRuns,
    CleanupQueueItems,
}

impl ControllerOperation {
    pub const ALL: [ControllerOperation; 6] = [
        ControllerOperation::CheckTenantQueue,
        ControllerOperation::UpdateStepRuns,
        ControllerOperation::UpdateStepRunsV2,
        ControllerOperation::TimeoutStepRuns,
        ControllerOperation::RetryStepRuns,
        ControllerOperation::CleanupQueueItems,
    ];

    pub fn description(&self) -> &'static str {
        match self {
            ControllerOperation::CheckTenantQueue => "check tenant queue",
            ControllerOperation::UpdateStepRuns => UpdateStrategy::V1.pool_description(),
            ControllerOperation::UpdateStepRunsV2 => UpdateStrategy::V2.pool_description(),
            ControllerOperation::TimeoutStepRuns => "timeout step runs",
            ControllerOperation::RetryStepRuns => "retry step runs",
            ControllerOperation::CleanupQueueItems => "cleanup queue items",
        }
    }
}

impl fmt::Display for ControllerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

fn bind<C, F, Fut>(component: Arc<C>, f: F) -> OperationFn
where
    C: Send + Sync + 'static,
    F: Fn(Arc<C>, Uuid) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SchedulerResult<bool>> + Send + 'static,
{
    operation_fn(move |tenant_id| f(Arc::clone(&component), tenant_id))
}

#[derive(Debug)]
struct ControllerPools {
    check_tenant_queue: Arc<OperationPool>,
    update_step_runs: Arc<OperationPool>,
    update_step_runs_v2: Arc<OperationPool>,
    timeout_step_runs: Arc<OperationPool>,
    retry_step_runs: Arc<OperationPool>,
    cleanup_queue_items: Arc<OperationPool>,
}

impl ControllerPools {
    fn get(&self, operation: ControllerOperation) -> &Arc<OperationPool> {
        match operation {
            ControllerOperation::CheckTenantQueue => &self.check_tenant_queue,
            ControllerOperation::UpdateStepRuns => &self.update_step_runs,
            ControllerOperation::UpdateStepRunsV2 => &self.update_step_runs_v2,
            ControllerOperation::TimeoutStepRuns => &self.timeout_step_runs,
            ControllerOperation::RetryStepRuns => &self.retry_step_runs,
            ControllerOperation::CleanupQueueItems => &self.cleanup_queue_items,
        }
    }

    fn handle_message(&self, message: &QueueMessage) -> SchedulerResult<()> {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(message))) {
            Ok(result) => result,
            Err(panic) => Err(SchedulerError::Internal(format!(
                "recovered from panic while handling {}: {}",
                message.id,
                panic_message(panic.as_ref())
            ))),
        }
    }

    fn dispatch(&self, message: &QueueMessage) -> SchedulerResult<()> {
        match message.id.as_str() {
            message_ids::CHECK_TENANT_QUEUE => {
                let metadata: TenantMetadata = message.decode_metadata()?;
                // unknown tenants are ignored by the pools
                self.check_tenant_queue.run_or_continue(metadata.tenant_id);
                self.update_step_runs.run_or_continue(metadata.tenant_id);
                self.update_step_runs_v2.run_or_continue(metadata.tenant_id);
                Ok(())
            }
            other => Err(SchedulerError::Validation(format!("unknown task: {other}"))),
        }
    }
}

pub struct QueueController {
    storage: Arc<dyn StorageEngine>,
    transport: Arc<dyn MessageQueue>,
    config: ControllerConfig,
    list_timeout: Duration,
    pools: Arc<ControllerPools>,
}

impl QueueController {
    /// Build the controller and its pools. Fails on invalid configuration.
    pub fn new(
        storage: Arc<dyn StorageEngine>,
        transport: Arc<dyn MessageQueue>,
        config: &SchedulerConfig,
    ) -> SchedulerResult<Self> {
        config.validate()?;
        let queue = config.queue.clone();

        let assignment = Arc::new(QueueAssignmentEngine::new(
            Arc::clone(&storage),
            Arc::clone(&transport),
            queue.clone(),
        ));
        let updates = Arc::new(UpdateCascadeProcessor::new(
            Arc::clone(&storage),
            Arc::clone(&transport),
            queue.clone(),
            UpdateStrategy::V1,
        ));
        let updates_v2 = Arc::new(UpdateCascadeProcessor::new(
            Arc::clone(&storage),
            Arc::clone(&transport),
            queue.clone(),
            UpdateStrategy::V2,
        ));
        let timeouts = Arc::new(TimeoutReaper::new(
            Arc::clone(&storage),
            Arc::clone(&transport),
            queue.clone(),
        ));
        let retries = Arc::new(RetryReaper::new(
            Arc::clone(&storage),
            Arc::clone(&transport),
            queue.clone(),
        ));
        let cleaner = Arc::new(QueueCleaner::new(Arc::clone(&storage), queue.clone()));

        let pool = |operation: ControllerOperation, f: OperationFn| {
            Arc::new(OperationPool::new(operation.description(), f))
        };

        let pools = ControllerPools {
            check_tenant_queue: pool(
                ControllerOperation::CheckTenantQueue,
                bind(assignment, |engine, tenant_id| async move {
                    engine.schedule_step_runs(tenant_id).await
                }),
            ),
            update_step_runs: pool(
                ControllerOperation::UpdateStepRuns,
                bind(updates, |processor, tenant_id| async move {
                    processor.process_step_run_updates(tenant_id).await
                }),
            ),
            update_step_runs_v2: pool(
                ControllerOperation::UpdateStepRunsV2,
                bind(updates_v2, |processor, tenant_id| async move {
                    processor.process_step_run_updates(tenant_id).await
                }),
            ),
            timeout_step_runs: pool(
                ControllerOperation::TimeoutStepRuns,
                bind(timeouts, |reaper, tenant_id| async move {
                    reaper.process_step_run_timeouts(tenant_id).await
                }),
            ),
            retry_step_runs: pool(
                ControllerOperation::RetryStepRuns,
                bind(retries, |reaper, tenant_id| async move {
                    reaper.process_step_run_retries(tenant_id).await
                }),
            ),
            cleanup_queue_items: pool(
                ControllerOperation::CleanupQueueItems,
                bind(cleaner, |cleaner, tenant_id| async move {
                    cleaner.cleanup_queue_items(tenant_id).await.map(|_| false)
                }),
            ),
        };

        Ok(Self {
            storage,
            transport,
            config: config.controller.clone(),
            list_timeout: queue.assignment_timeout(),
            pools: Arc::new(pools),
        })
    }

    pub fn partition_id(&self) -> &str {
        &self.config.partition_id
    }

    pub fn pool(&self, operation: ControllerOperation) -> &Arc<OperationPool> {
        self.pools.get(operation)
    }

    /// Handle one message from the partition channel.
    pub fn handle_message(&self, message: &QueueMessage) -> SchedulerResult<()> {
        self.pools.handle_message(message)
    }

    /// Run one driver tick for `operation` now.
    pub async fn run_tick(&self, operation: ControllerOperation) {
        tick(
            self.storage.as_ref(),
            &self.config.partition_id,
            self.list_timeout,
            self.pools.get(operation),
        )
        .await;
    }

    /// Subscribe to the partition channel and start the drivers.
    #[instrument(skip(self), fields(partition_id = %self.config.partition_id))]
    pub async fn start(&self) -> SchedulerResult<ControllerHandle> {
        let queue = QueueType::controller_partition(self.config.partition_id.clone());
        let pools = Arc::clone(&self.pools);
        let subscription = self
            .transport
            .subscribe(
                &queue,
                handler_fn(move |message: QueueMessage| {
                    let pools = Arc::clone(&pools);
                    async move {
                        pools.handle_message(&message).map_err(|e| {
                            error!(
                                target: QUEUE_LOG_TARGET,
                                message_id = %message.id,
                                error = %e,
                                "Could not handle job task"
                            );
                            e.context(&format!("could not handle job task {}", message.id))
                        })
                    }
                }),
            )
            .await
            .map_err(|e| e.context("could not subscribe to job processing queue"))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let drivers = ControllerOperation::ALL
            .iter()
            .map(|&operation| {
                let interval = match operation {
                    ControllerOperation::CleanupQueueItems => self.config.cleanup_interval(),
                    _ => self.config.driver_interval(),
                };
                tokio::spawn(drive(
                    Arc::clone(&self.storage),
                    self.config.partition_id.clone(),
                    self.list_timeout,
                    Arc::clone(self.pools.get(operation)),
                    interval,
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        info!(
            target: QUEUE_LOG_TARGET,
            partition_id = %self.config.partition_id,
            queue = %queue,
            "Queue controller started"
        );

        Ok(ControllerHandle {
            shutdown_tx,
            drivers,
            subscription: Some(subscription),
            pools: ControllerOperation::ALL
                .iter()
                .map(|&operation| Arc::clone(self.pools.get(operation)))
                .collect(),
        })
    }
}

async fn tick(
    storage: &dyn StorageEngine,
    partition_id: &str,
    list_timeout: Duration,
    pool: &OperationPool,
) {
    debug!(
        target: QUEUE_LOG_TARGET,
        operation = %pool.description(),
        "partition: running tick"
    );

    let tenants = match with_timeout(
        "list tenants",
        list_timeout,
        storage.list_tenants_by_partition(partition_id),
    )
    .await
    {
        Ok(tenants) => tenants,
        Err(e) => {
            error!(
                target: QUEUE_LOG_TARGET,
                operation = %pool.description(),
                error = %e,
                "Could not list tenants"
            );
            return;
        }
    };

    pool.set_tenants(tenants.iter().copied());
    for tenant_id in tenants {
        pool.run_or_continue(tenant_id);
    }
}

async fn drive(
    storage: Arc<dyn StorageEngine>,
    partition_id: String,
    list_timeout: Duration,
    pool: Arc<OperationPool>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                tick(storage.as_ref(), &partition_id, list_timeout, &pool).await;
            }
        }
    }

    debug!(
        target: QUEUE_LOG_TARGET,
        operation = %pool.description(),
        "Driver stopped"
    );
}

/// Running controller; dropping it without `shutdown` leaves the drivers
/// running until the runtime stops.
#[derive(Debug)]
pub struct ControllerHandle {
    shutdown_tx: watch::Sender<bool>,
    drivers: Vec<JoinHandle<()>>,
    subscription: Option<Subscription>,
    pools: Vec<Arc<OperationPool>>,
}

impl ControllerHandle {
    /// Stop the drivers, unsubscribe, then wait for every in-flight
    /// operation to finish.
    pub async fn shutdown(mut self) -> SchedulerResult<()> {
        let mut errors = ErrorAggregator::new();
        let _ = self.shutdown_tx.send(true);

        for driver in self.drivers.drain(..) {
            if let Err(e) = driver.await {
                warn!(target: QUEUE_LOG_TARGET, error = %e, "Driver task did not finish cleanly");
            }
        }

        if let Some(subscription) = self.subscription.take() {
            errors.record(
                subscription
                    .unsubscribe()
                    .await
                    .map_err(|e| e.context("could not cleanup job processing queue")),
            );
        }

        for pool in &self.pools {
            pool.shutdown().await;
        }

        info!(target: QUEUE_LOG_TARGET, "Queue controller stopped");
        errors.into_result()
    }
}
