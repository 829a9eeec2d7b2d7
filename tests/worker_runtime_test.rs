//! Worker runtime executing typed actions and reporting action events.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tasker_scheduler::constants::message_ids;
use tasker_scheduler::messaging::{InMemoryMessageQueue, QueueType};
use tasker_scheduler::worker::{
    ActionEvent, ActionEventType, ActionRegistry, AssignedAction, AssignedActionType,
    TypedAction, WorkerRuntime,
};
use tasker_scheduler::SchedulerError;
use uuid::Uuid;

#[derive(Deserialize)]
struct Greeting {
    name: String,
}

#[derive(Serialize)]
struct Reply {
    message: String,
}

fn runtime() -> (Arc<WorkerRuntime>, Arc<InMemoryMessageQueue>) {
    let actions = Arc::new(ActionRegistry::new());
    actions
        .register_in_service(
            "greeter",
            Arc::new(TypedAction::new("hello", |_ctx, input: Greeting| async move {
                Ok::<_, String>(Reply {
                    message: format!("hello, {}", input.name),
                })
            })),
        )
        .unwrap();
    actions
        .register_in_service(
            "greeter",
            Arc::new(TypedAction::new("refuse", |_ctx, _input: Greeting| async move {
                Err::<Reply, _>("not today")
            })),
        )
        .unwrap();
    actions
        .register_in_service(
            "greeter",
            Arc::new(TypedAction::new("wait", |ctx, _input: serde_json::Value| async move {
                ctx.cancelled().await;
                Ok::<_, String>(json!({"cancelled": true}))
            })),
        )
        .unwrap();

    actions
        .register_in_service(
            "greeter",
            Arc::new(TypedAction::new("crash", |_ctx, _input: Greeting| async move {
                if true {
                    panic!("greeter fell over");
                }
                Ok::<Reply, String>(Reply {
                    message: String::new(),
                })
            })),
        )
        .unwrap();

    let transport = Arc::new(InMemoryMessageQueue::new());
    let runtime = Arc::new(WorkerRuntime::new(Uuid::new_v4(), actions, transport.clone()));
    (runtime, transport)
}

fn assigned(
    runtime: &WorkerRuntime,
    step_run_id: Uuid,
    action_id: &str,
    action_type: AssignedActionType,
) -> AssignedAction {
    AssignedAction {
        tenant_id: Uuid::new_v4(),
        worker_id: runtime.worker_id(),
        step_run_id,
        action_id: action_id.to_string(),
        action_type,
        payload: json!({"name": "ada"}),
    }
}

fn events(transport: &InMemoryMessageQueue, runtime: &WorkerRuntime) -> Vec<ActionEvent> {
    transport
        .messages_with_id(&runtime.event_queue(), message_ids::ACTION_EVENT)
        .iter()
        .map(|m| m.decode_payload().unwrap())
        .collect()
}

#[tokio::test]
async fn test_completed_action_reports_output() {
    let (runtime, transport) = runtime();
    let step_run_id = Uuid::new_v4();

    let output = runtime
        .handle_assigned_action(assigned(
            &runtime,
            step_run_id,
            "greeter:hello",
            AssignedActionType::StartStepRun,
        ))
        .await
        .unwrap();
    assert_eq!(output, Some(json!({"message": "hello, ada"})));

    let events = events(&transport, &runtime);
    let kinds: Vec<ActionEventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(kinds, vec![ActionEventType::Started, ActionEventType::Completed]);
    assert_eq!(
        events[1].event_payload.as_deref(),
        Some(r#"{"message":"hello, ada"}"#)
    );
    assert!(events.iter().all(|e| e.step_run_id == step_run_id));
    assert!(runtime.cancellations().is_empty());
}

#[tokio::test]
async fn test_failed_action_reports_error_text() {
    let (runtime, transport) = runtime();

    let err = runtime
        .handle_assigned_action(assigned(
            &runtime,
            Uuid::new_v4(),
            "greeter:refuse",
            AssignedActionType::StartStepRun,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Worker(_)));

    let events = events(&transport, &runtime);
    assert_eq!(events.last().unwrap().event_type, ActionEventType::Failed);
    assert!(events
        .last()
        .unwrap()
        .event_payload
        .as_deref()
        .unwrap()
        .contains("not today"));
}

#[tokio::test]
async fn test_cancelled_action_reports_nothing_after_start() {
    let (runtime, transport) = runtime();
    let step_run_id = Uuid::new_v4();

    let running = {
        let runtime = Arc::clone(&runtime);
        let action = assigned(&runtime, step_run_id, "greeter:wait", AssignedActionType::StartStepRun);
        tokio::spawn(async move { runtime.handle_assigned_action(action).await })
    };

    for _ in 0..200 {
        if runtime.cancellations().contains(step_run_id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    runtime
        .handle_assigned_action(assigned(
            &runtime,
            step_run_id,
            "greeter:wait",
            AssignedActionType::CancelStepRun,
        ))
        .await
        .unwrap();

    assert_eq!(running.await.unwrap().unwrap(), None);
    let kinds: Vec<ActionEventType> = events(&transport, &runtime)
        .iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(kinds, vec![ActionEventType::Started]);
    assert!(!runtime.cancellations().contains(step_run_id));
}

#[tokio::test]
async fn test_events_go_to_worker_channel() {
    let (runtime, transport) = runtime();
    runtime
        .handle_assigned_action(assigned(
            &runtime,
            Uuid::new_v4(),
            "greeter:hello",
            AssignedActionType::StartStepRun,
        ))
        .await
        .unwrap();

    assert_eq!(
        runtime.event_queue(),
        QueueType::WorkerEvents(runtime.worker_id())
    );
    assert_eq!(transport.total_sent(), 2);
}

#[tokio::test]
async fn test_panicking_action_reports_failure_and_releases_step_run() {
    let (runtime, transport) = runtime();
    let step_run_id = Uuid::new_v4();

    let err = runtime
        .handle_assigned_action(assigned(
            &runtime,
            step_run_id,
            "greeter:crash",
            AssignedActionType::StartStepRun,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Worker(ref msg) if msg.contains("greeter fell over")));

    let events = events(&transport, &runtime);
    let kinds: Vec<ActionEventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(kinds, vec![ActionEventType::Started, ActionEventType::Failed]);
    assert!(runtime.cancellations().is_empty());

    // The runtime keeps serving after the panic
    let output = runtime
        .handle_assigned_action(assigned(
            &runtime,
            Uuid::new_v4(),
            "greeter:hello",
            AssignedActionType::StartStepRun,
        ))
        .await
        .unwrap();
    assert!(output.is_some());
}
