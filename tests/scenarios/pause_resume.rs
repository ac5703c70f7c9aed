//! Test: Pause and Resume - pause scopes, held responses and restarts

use crate::helpers::*;
use pipeline_engine::core::{InterruptType, Status};

const APPROVAL_CHAIN: &str = r#"
id: "release"
name: "Test: Pause"
root: "pipeline"
nodes:
  - id: "pipeline"
    kind: PIPELINE
    facilitator: CHILD_CHAIN
    children: ["approve", "deploy"]
  - id: "approve"
    kind: STEP
    facilitator: ASYNC
    step_type: "Wait"
  - id: "deploy"
    kind: STEP
    step_type: "Noop"
"#;

/// Test that a response arriving while paused is held until resume
#[tokio::test]
async fn test_pause_holds_response() {
    let engine = engine();
    let (id, result) = start_and_settle(&engine, plan_from_yaml(APPROVAL_CHAIN)).await;
    let approve = result.node("approve").id;

    engine
        .submit_interrupt(InterruptType::Pause, id, None)
        .await
        .unwrap();
    let result = settle(&engine, id).await;
    assert_node_status(&result, "approve", Status::Pausing);
    // Containers keep running
    assert_node_status(&result, "pipeline", Status::Running);
    assert!(result.run.pause_scopes.contains(&result.node("pipeline").id));

    engine.submit_task_response(approve, succeeded()).await.unwrap();
    let result = settle(&engine, id).await;
    let paused = result.node("approve");
    assert_eq!(paused.status, Status::Paused);
    assert!(paused.held_response.is_some());
    assert!(!result.ran("deploy"));

    engine
        .submit_interrupt(InterruptType::Resume, id, None)
        .await
        .unwrap();
    engine.run_to_completion(id).await.unwrap();
    let result = snapshot(&engine, id).await;

    assert_run_status(&result, Status::Succeeded);
    let approve = result.node("approve");
    assert_eq!(approve.status, Status::Succeeded);
    assert!(approve.held_response.is_none());
    assert_node_status(&result, "deploy", Status::Succeeded);
    assert!(result.run.pause_scopes.is_empty());

    let effects: Vec<_> = approve
        .interrupt_history
        .iter()
        .map(|e| e.interrupt_type)
        .collect();
    assert_eq!(effects, vec![InterruptType::Pause, InterruptType::Resume]);
}

/// Test that resuming before the response arrives lets the step finish normally
#[tokio::test]
async fn test_resume_while_pausing() {
    let engine = engine();
    let (id, result) = start_and_settle(&engine, plan_from_yaml(APPROVAL_CHAIN)).await;
    let approve = result.node("approve").id;

    engine.submit_interrupt(InterruptType::Pause, id, None).await.unwrap();
    settle(&engine, id).await;
    engine.submit_interrupt(InterruptType::Resume, id, None).await.unwrap();
    let result = settle(&engine, id).await;
    assert_node_status(&result, "approve", Status::Resumed);

    engine.submit_task_response(approve, succeeded()).await.unwrap();
    engine.run_to_completion(id).await.unwrap();
    let result = snapshot(&engine, id).await;
    assert_run_status(&result, Status::Succeeded);
}

/// Test that nodes queued inside a pause scope start paused
#[tokio::test]
async fn test_paused_before_start() {
    let engine = engine();
    let id = engine.start_run(plan_from_yaml(APPROVAL_CHAIN)).await.unwrap();

    // Processed before the root's start message
    engine.submit_interrupt(InterruptType::Pause, id, None).await.unwrap();
    let result = settle(&engine, id).await;
    assert_node_status(&result, "pipeline", Status::Paused);
    assert!(result.node("pipeline").started_at.is_none());
    assert!(!result.ran("approve"));

    engine.submit_interrupt(InterruptType::Resume, id, None).await.unwrap();
    let result = settle(&engine, id).await;
    assert_node_status(&result, "pipeline", Status::Running);
    assert_node_status(&result, "approve", Status::Running);

    let approve = result.node("approve").id;
    engine.submit_task_response(approve, succeeded()).await.unwrap();
    engine.run_to_completion(id).await.unwrap();
    assert_run_status(&snapshot(&engine, id).await, Status::Succeeded);
}

/// Test that aborting a paused run works
#[tokio::test]
async fn test_abort_paused_run() {
    let engine = engine();
    let (id, _) = start_and_settle(&engine, plan_from_yaml(APPROVAL_CHAIN)).await;

    engine.submit_interrupt(InterruptType::Pause, id, None).await.unwrap();
    settle(&engine, id).await;
    engine.submit_interrupt(InterruptType::Abort, id, None).await.unwrap();
    let result = settle(&engine, id).await;

    assert_run_status(&result, Status::Aborted);
    assert_node_status(&result, "approve", Status::Aborted);
}
