//! Logical queue routing.
//!
//! Queue names are restricted to lowercase alphanumerics and underscores so
//! that every name is also a valid pgmq queue name.

use crate::constants::queues;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueType {
    /// Shared channel for cancellation, failure and queued notifications
    JobProcessing,
    /// Shared channel for workflow run completion notifications
    WorkflowProcessing,
    /// Per-dispatcher assignment channel
    Dispatcher(Uuid),
    /// Per-partition channel the queue controller subscribes to
    Controller(String),
    /// Action events emitted by one worker
    WorkerEvents(Uuid),
}

impl QueueType {
    pub fn dispatcher(dispatcher_id: Uuid) -> Self {
        Self::Dispatcher(dispatcher_id)
    }

    pub fn controller_partition(partition_id: impl Into<String>) -> Self {
        Self::Controller(partition_id.into())
    }

    pub fn name(&self) -> String {
        match self {
            QueueType::JobProcessing => queues::JOB_PROCESSING_QUEUE.to_string(),
            QueueType::WorkflowProcessing => queues::WORKFLOW_PROCESSING_QUEUE.to_string(),
            QueueType::Dispatcher(id) => {
                format!("{}_{}", queues::DISPATCHER_QUEUE_PREFIX, id.simple())
            }
            QueueType::Controller(partition) => format!(
                "{}_{}_{}",
                queues::CONTROLLER_QUEUE_PREFIX,
                queues::JOB_CONTROLLER,
                sanitize(partition)
            ),
            QueueType::WorkerEvents(id) => format!("worker_events_{}", id.simple()),
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_names() {
        assert_eq!(QueueType::JobProcessing.name(), "job_processing_queue");
        assert_eq!(
            QueueType::controller_partition("Partition-A").name(),
            "controller_jobs_partition_a"
        );

        let id = Uuid::new_v4();
        let name = QueueType::dispatcher(id).name();
        assert!(name.starts_with("dispatcher_"));
        assert!(!name.contains('-'));
        assert!(name.len() <= 48);
    }
}
