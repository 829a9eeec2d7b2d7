//! # Queue Controller
//!
//! Runs the per-partition queue controller until interrupted.
//!
//! Usage: `queue-controller [CONFIG_PATH]`. The path may also be given
//! through `TASKER_CONFIG_PATH`; environment overrides (`TASKER__*`) apply
//! either way.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tasker_scheduler::config::{ConfigLoader, MessagingBackend, SchedulerConfig};
use tasker_scheduler::logging::init_structured_logging;
use tasker_scheduler::messaging::{InMemoryMessageQueue, MessageQueue, PgmqMessageQueue};
use tasker_scheduler::queue::QueueController;
use tasker_scheduler::storage::{InMemoryStorage, PostgresStorage, StorageEngine};
use tracing::{info, warn};

const CONFIG_PATH_ENV: &str = "TASKER_CONFIG_PATH";

#[tokio::main]
async fn main() -> Result<()> {
    init_structured_logging();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
        .map(PathBuf::from);
    let config = ConfigLoader::load(config_path.as_deref())
        .context("Failed to load scheduler configuration")?;

    let (storage, transport) = build_backends(&config).await?;
    let controller = QueueController::new(storage, transport, &config)
        .context("Failed to build queue controller")?;

    let handle = controller
        .start()
        .await
        .context("Failed to start queue controller")?;
    info!(partition_id = %controller.partition_id(), "Queue controller running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    handle
        .shutdown()
        .await
        .context("Queue controller did not shut down cleanly")?;
    info!("Queue controller stopped");
    Ok(())
}

async fn build_backends(
    config: &SchedulerConfig,
) -> Result<(Arc<dyn StorageEngine>, Arc<dyn MessageQueue>)> {
    match config.messaging.backend {
        MessagingBackend::Pgmq => {
            let storage = PostgresStorage::connect(&config.database)
                .await
                .context("Failed to connect to database")?;
            storage.migrate().await.context("Failed to run migrations")?;
            let transport = PgmqMessageQueue::new(storage.pool().clone(), config.messaging.clone());
            Ok((Arc::new(storage), Arc::new(transport)))
        }
        MessagingBackend::InMemory => {
            warn!("Using in-memory storage and transport; state is lost on exit");
            Ok((
                Arc::new(InMemoryStorage::new()),
                Arc::new(InMemoryMessageQueue::new()),
            ))
        }
    }
}
