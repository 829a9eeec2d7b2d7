//! Step run update processing through both update paths.

mod common;

use common::*;
use tasker_scheduler::constants::message_ids;
use tasker_scheduler::messaging::{QueueType, StepRunQueuedPayload, WorkflowRunFinishedPayload};
use tasker_scheduler::models::{InternalQueue, StepRunEvent};
use tasker_scheduler::queue::{UpdateCascadeProcessor, UpdateStrategy};
use tasker_scheduler::{StepRunStatus, WorkflowRunStatus};
use uuid::Uuid;

fn processor(fixture: &TenantFixture, strategy: UpdateStrategy) -> UpdateCascadeProcessor {
    UpdateCascadeProcessor::new(
        fixture.storage_engine(),
        fixture.message_queue(),
        queue_config(),
        strategy,
    )
}

fn queued_step_runs(fixture: &TenantFixture) -> Vec<Uuid> {
    let mut ids: Vec<Uuid> = fixture
        .messages(&QueueType::JobProcessing, message_ids::STEP_RUN_QUEUED)
        .iter()
        .map(|m| m.decode_payload::<StepRunQueuedPayload>().unwrap().step_run_id)
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_v1_queues_only_children_with_all_parents_succeeded() {
    let fixture = TenantFixture::new();
    let (workflow_run_id, job_run_id) = (Uuid::new_v4(), Uuid::new_v4());

    let parent = fixture.step_run(workflow_run_id, job_run_id, "svc:extract");
    let sibling = fixture.step_run(workflow_run_id, job_run_id, "svc:fetch");
    let ready_children: Vec<_> = (0..3)
        .map(|_| fixture.child_of(&[&parent], "svc:transform"))
        .collect();
    let waiting_child = fixture.child_of(&[&parent, &sibling], "svc:join");

    fixture.succeed(parent.id, InternalQueue::StepRunUpdate);
    let should_continue = processor(&fixture, UpdateStrategy::V1)
        .process_step_run_updates(fixture.tenant_id)
        .await
        .unwrap();

    assert!(!should_continue);
    let mut expected: Vec<Uuid> = ready_children.iter().map(|c| c.id).collect();
    expected.sort();
    assert_eq!(queued_step_runs(&fixture), expected);

    // Once the sibling succeeds the join step becomes startable
    fixture.transport.clear_history();
    fixture.succeed(sibling.id, InternalQueue::StepRunUpdate);
    processor(&fixture, UpdateStrategy::V1)
        .process_step_run_updates(fixture.tenant_id)
        .await
        .unwrap();

    assert_eq!(queued_step_runs(&fixture), vec![waiting_child.id]);
}

#[tokio::test]
async fn test_v1_reports_finished_workflow_run() {
    let fixture = TenantFixture::new();
    let workflow_run_id = Uuid::new_v4();
    let step_run = fixture.step_run(workflow_run_id, Uuid::new_v4(), "svc:only");

    fixture.succeed(step_run.id, InternalQueue::StepRunUpdate);
    processor(&fixture, UpdateStrategy::V1)
        .process_step_run_updates(fixture.tenant_id)
        .await
        .unwrap();

    let finished = fixture.messages(
        &QueueType::WorkflowProcessing,
        message_ids::WORKFLOW_RUN_FINISHED,
    );
    assert_eq!(finished.len(), 1);
    let payload: WorkflowRunFinishedPayload = finished[0].decode_payload().unwrap();
    assert_eq!(payload.workflow_run_id, workflow_run_id);
    assert_eq!(payload.status, WorkflowRunStatus::Succeeded);
    assert!(queued_step_runs(&fixture).is_empty());
}

#[tokio::test]
async fn test_v1_failed_step_run_with_retries_left_is_not_terminal() {
    let fixture = TenantFixture::new();
    let step_run = tasker_scheduler::models::StepRun::new(
        fixture.tenant_id,
        Uuid::new_v4(),
        Uuid::new_v4(),
        "svc:flaky",
    )
    .with_max_retries(1);
    fixture.storage.insert_step_run(step_run.clone());

    fixture.record(
        step_run.id,
        StepRunEvent::Failed {
            error: "boom".to_string(),
        },
        InternalQueue::StepRunUpdate,
    );
    processor(&fixture, UpdateStrategy::V1)
        .process_step_run_updates(fixture.tenant_id)
        .await
        .unwrap();

    let stored = fixture.storage.step_run(step_run.id).unwrap();
    assert_eq!(stored.status, StepRunStatus::Pending);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(fixture.transport.total_sent(), 0);
}

#[tokio::test]
async fn test_v2_leaves_child_queueing_to_storage() {
    let fixture = TenantFixture::new();
    let (workflow_run_id, job_run_id) = (Uuid::new_v4(), Uuid::new_v4());
    let parent = fixture.step_run(workflow_run_id, job_run_id, "svc:extract");
    let child = fixture.child_of(&[&parent], "svc:transform");

    fixture.succeed(parent.id, InternalQueue::StepRunUpdateV2);
    processor(&fixture, UpdateStrategy::V2)
        .process_step_run_updates(fixture.tenant_id)
        .await
        .unwrap();

    assert!(queued_step_runs(&fixture).is_empty());
    let queued: Vec<Uuid> = fixture
        .storage
        .queue_items_for(fixture.tenant_id)
        .into_iter()
        .filter(|item| item.queued)
        .map(|item| item.step_run_id)
        .collect();
    assert_eq!(queued, vec![child.id]);
}

#[tokio::test]
async fn test_paths_consume_separate_internal_queues() {
    let fixture = TenantFixture::new();
    let step_run = fixture.step_run(Uuid::new_v4(), Uuid::new_v4(), "svc:only");
    fixture.succeed(step_run.id, InternalQueue::StepRunUpdateV2);

    processor(&fixture, UpdateStrategy::V1)
        .process_step_run_updates(fixture.tenant_id)
        .await
        .unwrap();
    assert_eq!(
        fixture.storage.step_run(step_run.id).unwrap().status,
        StepRunStatus::Pending
    );

    processor(&fixture, UpdateStrategy::V2)
        .process_step_run_updates(fixture.tenant_id)
        .await
        .unwrap();
    assert_eq!(
        fixture.storage.step_run(step_run.id).unwrap().status,
        StepRunStatus::Succeeded
    );
}

#[tokio::test]
async fn test_update_limit_requests_continue() {
    let fixture = TenantFixture::new();
    let mut config = queue_config();
    config.update_limit = 2;
    let workflow_run_id = Uuid::new_v4();
    for _ in 0..3 {
        let step_run = fixture.step_run(workflow_run_id, Uuid::new_v4(), "svc:act");
        fixture.succeed(step_run.id, InternalQueue::StepRunUpdate);
    }

    let processor = UpdateCascadeProcessor::new(
        fixture.storage_engine(),
        fixture.message_queue(),
        config,
        UpdateStrategy::V1,
    );
    assert!(processor.process_step_run_updates(fixture.tenant_id).await.unwrap());
    assert!(!processor.process_step_run_updates(fixture.tenant_id).await.unwrap());
}

#[tokio::test]
async fn test_storage_failure_is_returned() {
    let fixture = TenantFixture::new();
    fixture.storage.fail_next("process_step_run_updates", 1);

    let result = processor(&fixture, UpdateStrategy::V1)
        .process_step_run_updates(fixture.tenant_id)
        .await;
    assert!(result.is_err());
}
