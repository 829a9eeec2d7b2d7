//! Timeout and retry reaping, and processed-row cleanup.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use tasker_scheduler::constants::message_ids;
use tasker_scheduler::messaging::{QueueType, StepRunFailedPayload, StepRunRetryPayload};
use tasker_scheduler::models::{StepRun, StepRunEvent, InternalQueue};
use tasker_scheduler::queue::{QueueCleaner, RetryReaper, TimeoutReaper};
use tasker_scheduler::storage::{QueueTable, StorageEngine};
use tasker_scheduler::{FailureReason, StepRunStatus};
use uuid::Uuid;

fn running_step_run(fixture: &TenantFixture) -> StepRun {
    let step_run = StepRun::new(fixture.tenant_id, Uuid::new_v4(), Uuid::new_v4(), "svc:slow")
        .with_status(StepRunStatus::Running);
    fixture.storage.insert_step_run(step_run.clone());
    step_run
}

fn reaper(fixture: &TenantFixture) -> TimeoutReaper {
    TimeoutReaper::new(fixture.storage_engine(), fixture.message_queue(), queue_config())
}

#[tokio::test]
async fn test_expired_step_runs_fail_once_with_shared_timestamp() {
    let fixture = TenantFixture::new();
    let mut expected = Vec::new();
    for _ in 0..25 {
        let step_run = running_step_run(&fixture);
        fixture.expire_timeout(step_run.id).await;
        expected.push(step_run.id);
    }
    expected.sort();

    assert!(!reaper(&fixture)
        .process_step_run_timeouts(fixture.tenant_id)
        .await
        .unwrap());

    let failed: Vec<StepRunFailedPayload> = fixture
        .messages(&QueueType::JobProcessing, message_ids::STEP_RUN_FAILED)
        .iter()
        .map(|m| m.decode_payload().unwrap())
        .collect();
    let mut ids: Vec<Uuid> = failed.iter().map(|p| p.step_run_id).collect();
    ids.sort();
    assert_eq!(ids, expected);
    assert!(failed.iter().all(|p| p.reason == FailureReason::TimedOut));
    assert!(failed.iter().all(|p| p.failed_at == failed[0].failed_at));

    // Entries are consumed; a second pass finds nothing
    fixture.transport.clear_history();
    reaper(&fixture)
        .process_step_run_timeouts(fixture.tenant_id)
        .await
        .unwrap();
    assert!(fixture
        .messages(&QueueType::JobProcessing, message_ids::STEP_RUN_FAILED)
        .is_empty());
}

#[tokio::test]
async fn test_future_and_finished_timeouts_are_skipped() {
    let fixture = TenantFixture::new();
    let pending = running_step_run(&fixture);
    fixture
        .storage
        .create_timeout_queue_item(
            fixture.tenant_id,
            pending.id,
            0,
            Utc::now() + ChronoDuration::minutes(5),
        )
        .await
        .unwrap();

    let finished = StepRun::new(fixture.tenant_id, Uuid::new_v4(), Uuid::new_v4(), "svc:done")
        .with_status(StepRunStatus::Succeeded);
    fixture.storage.insert_step_run(finished.clone());
    fixture.expire_timeout(finished.id).await;

    reaper(&fixture)
        .process_step_run_timeouts(fixture.tenant_id)
        .await
        .unwrap();

    assert_eq!(fixture.transport.total_sent(), 0);
}

#[tokio::test]
async fn test_send_failure_does_not_stop_other_notifications() {
    let fixture = TenantFixture::new();
    for _ in 0..4 {
        let step_run = running_step_run(&fixture);
        fixture.expire_timeout(step_run.id).await;
    }
    fixture.transport.fail_next_sends(1);

    reaper(&fixture)
        .process_step_run_timeouts(fixture.tenant_id)
        .await
        .unwrap();

    assert_eq!(
        fixture
            .messages(&QueueType::JobProcessing, message_ids::STEP_RUN_FAILED)
            .len(),
        3
    );
}

#[tokio::test]
async fn test_timeout_limit_requests_continue() {
    let fixture = TenantFixture::new();
    let mut config = queue_config();
    config.timeout_limit = 2;
    for _ in 0..3 {
        let step_run = running_step_run(&fixture);
        fixture.expire_timeout(step_run.id).await;
    }

    let reaper = TimeoutReaper::new(fixture.storage_engine(), fixture.message_queue(), config);
    assert!(reaper.process_step_run_timeouts(fixture.tenant_id).await.unwrap());
    assert!(!reaper.process_step_run_timeouts(fixture.tenant_id).await.unwrap());
}

#[tokio::test]
async fn test_failed_step_run_with_retries_is_retried() {
    let fixture = TenantFixture::new();
    let step_run = StepRun::new(fixture.tenant_id, Uuid::new_v4(), Uuid::new_v4(), "svc:flaky")
        .with_max_retries(2);
    fixture.storage.insert_step_run(step_run.clone());
    fixture.record(
        step_run.id,
        StepRunEvent::Failed {
            error: "boom".to_string(),
        },
        InternalQueue::StepRunUpdate,
    );
    fixture
        .storage
        .process_step_run_updates(fixture.tenant_id, 10)
        .await
        .unwrap();

    let retries = RetryReaper::new(fixture.storage_engine(), fixture.message_queue(), queue_config());
    retries.process_step_run_retries(fixture.tenant_id).await.unwrap();

    let sent = fixture.messages(&QueueType::JobProcessing, message_ids::STEP_RUN_RETRY);
    assert_eq!(sent.len(), 1);
    let payload: StepRunRetryPayload = sent[0].decode_payload().unwrap();
    assert_eq!(payload.step_run_id, step_run.id);
    assert_eq!(payload.retry_count, 1);

    // Consumed on the first pass
    retries.process_step_run_retries(fixture.tenant_id).await.unwrap();
    assert_eq!(
        fixture
            .messages(&QueueType::JobProcessing, message_ids::STEP_RUN_RETRY)
            .len(),
        1
    );
}

#[tokio::test]
async fn test_cleanup_deletes_only_processed_rows() {
    let fixture = TenantFixture::new();
    let mut config = queue_config();
    config.cleanup_batch_size = 3;

    fixture.worker(4, &["svc:act"]);
    for _ in 0..10 {
        fixture.enqueue("svc:act", 1).await;
    }
    tasker_scheduler::queue::QueueAssignmentEngine::new(
        fixture.storage_engine(),
        fixture.message_queue(),
        queue_config(),
    )
    .schedule_step_runs(fixture.tenant_id)
    .await
    .unwrap();

    let cleaner = QueueCleaner::new(fixture.storage_engine(), config);
    let report = cleaner.cleanup_queue_items(fixture.tenant_id).await.unwrap();

    assert_eq!(report.total(), 4);
    assert_eq!(report.deleted.get("QueueItem"), Some(&4));
    assert_eq!(fixture.storage.row_count(fixture.tenant_id, QueueTable::Queue), 6);

    let again = cleaner.cleanup_queue_items(fixture.tenant_id).await.unwrap();
    assert_eq!(again.total(), 0);
}

#[tokio::test]
async fn test_cleanup_continues_past_failing_table() {
    let fixture = TenantFixture::new();
    let step_run = running_step_run(&fixture);
    fixture.expire_timeout(step_run.id).await;
    reaper(&fixture)
        .process_step_run_timeouts(fixture.tenant_id)
        .await
        .unwrap();

    fixture.storage.fail_next("get_min_max_processed", 1);
    let cleaner = QueueCleaner::new(fixture.storage_engine(), queue_config());
    assert!(cleaner.cleanup_queue_items(fixture.tenant_id).await.is_err());

    // The first table failed; the timeout table was still cleaned
    assert_eq!(
        fixture.storage.row_count(fixture.tenant_id, QueueTable::Timeout),
        0
    );
}
