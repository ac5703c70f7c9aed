//! Test: Interrupts - aborting runs and subtrees, rejected interrupts

use crate::helpers::*;
use pipeline_engine::core::{InterruptState, InterruptType, Status};
use pipeline_engine::execution::events::InterruptEvent;
use pipeline_engine::execution::{
    EngineError, ExecutionEvent, InterruptRejection, Message, MessageQueue, SdkResponseEvent,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

const PARALLEL_WAITS: &str = r#"
id: "approvals"
name: "Test: Interrupts"
root: "pipeline"
nodes:
  - id: "pipeline"
    kind: PIPELINE
    facilitator: CHILD_CHAIN
    children: ["approvals", "deploy"]
  - id: "approvals"
    kind: STAGE
    facilitator: CHILDREN
    children: ["security", "product", "lint"]
  - id: "security"
    kind: STEP
    facilitator: ASYNC
    step_type: "Wait"
  - id: "product"
    kind: STEP
    facilitator: ASYNC
    step_type: "Wait"
  - id: "lint"
    kind: STEP
    step_type: "Noop"
  - id: "deploy"
    kind: STEP
    step_type: "Noop"
"#;

/// Node executions among `ids` that an adviser decided on
fn advised(events: &Arc<Mutex<Vec<ExecutionEvent>>>, ids: &[Uuid]) -> Vec<Uuid> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::AdviserDecision {
                node_execution_id, ..
            } if ids.contains(node_execution_id) => Some(*node_execution_id),
            _ => None,
        })
        .collect()
}

/// Test that aborting the run stops every active node
#[tokio::test]
async fn test_abort_run() {
    let test_engine = TestEngine::new();
    let events = test_engine.events();
    let engine = test_engine.build();
    let (id, result) = start_and_settle(&engine, plan_from_yaml(PARALLEL_WAITS)).await;
    assert_node_status(&result, "security", Status::Running);
    assert_node_status(&result, "lint", Status::Succeeded);

    let interrupt_id = engine
        .submit_interrupt(InterruptType::Abort, id, None)
        .await
        .unwrap();
    let result = settle(&engine, id).await;

    assert_run_status(&result, Status::Aborted);
    for node in ["pipeline", "approvals", "security", "product"] {
        assert_node_status(&result, node, Status::Aborted);
    }
    // Finished nodes keep their status
    assert_node_status(&result, "lint", Status::Succeeded);
    assert!(!result.ran("deploy"));

    let security = result.node("security");
    assert_eq!(security.interrupt_history.len(), 1);
    assert_eq!(security.interrupt_history[0].interrupt_id, interrupt_id);

    let interrupt = engine.interrupt(interrupt_id).await.unwrap().unwrap();
    assert_eq!(interrupt.state, InterruptState::Processed);
    assert!(events.lock().unwrap().iter().any(|e| matches!(
        e,
        ExecutionEvent::InterruptProcessed { interrupt_id: i, .. } if *i == interrupt_id
    )));

    // A late task response changes nothing, whether submitted or already queued
    engine
        .submit_task_response(security.id, succeeded())
        .await
        .unwrap();
    let queued = SdkResponseEvent::StepResponse {
        node_execution_id: security.id,
        outcome: succeeded(),
    };
    engine
        .queue()
        .publish(Message::encode(&queued, None).unwrap(), Duration::ZERO)
        .await
        .unwrap();
    let result = settle(&engine, id).await;
    assert_node_status(&result, "security", Status::Aborted);

    let aborted: Vec<_> = ["pipeline", "approvals", "security", "product"]
        .iter()
        .map(|n| result.node(n).id)
        .collect();
    assert!(advised(&events, &aborted).is_empty());
}

/// Test that aborting one branch ends its parent aborted
#[tokio::test]
async fn test_abort_subtree() {
    let test_engine = TestEngine::new();
    let events = test_engine.events();
    let engine = test_engine.build();
    let (id, result) = start_and_settle(&engine, plan_from_yaml(PARALLEL_WAITS)).await;
    let security = result.node("security").id;

    engine
        .submit_interrupt(InterruptType::Abort, id, Some(security))
        .await
        .unwrap();
    let result = settle(&engine, id).await;

    assert_node_status(&result, "security", Status::Aborted);
    // The sibling still waits, so the stage is not done yet
    assert_node_status(&result, "product", Status::Running);
    assert_node_status(&result, "approvals", Status::Running);
    assert!(!result.run.is_finished());

    let product = result.node("product").id;
    engine.submit_task_response(product, succeeded()).await.unwrap();
    let result = settle(&engine, id).await;

    assert_node_status(&result, "product", Status::Succeeded);
    assert_node_status(&result, "approvals", Status::Aborted);
    assert_run_status(&result, Status::Aborted);
    assert!(!result.ran("deploy"));

    // Nothing in the aborted subtree is advised, even after a late response
    engine.submit_task_response(security, succeeded()).await.unwrap();
    let result = settle(&engine, id).await;
    assert_node_status(&result, "security", Status::Aborted);
    let aborted = [security, result.node("approvals").id, result.node("pipeline").id];
    assert!(advised(&events, &aborted).is_empty());
}

/// Test that an abort delivered again after it took effect is still processed
#[tokio::test]
async fn test_redelivered_abort_is_processed() {
    let test_engine = TestEngine::new();
    let events = test_engine.events();
    let engine = test_engine.build();
    let (id, _) = start_and_settle(&engine, plan_from_yaml(PARALLEL_WAITS)).await;

    let interrupt_id = engine
        .submit_interrupt(InterruptType::Abort, id, None)
        .await
        .unwrap();
    let result = settle(&engine, id).await;
    assert_run_status(&result, Status::Aborted);

    // The abort was applied but its delivery was never acknowledged
    let mut interrupt = engine.interrupt(interrupt_id).await.unwrap().unwrap();
    interrupt.state = InterruptState::Processing;
    interrupt.processed_at = None;
    engine.store().update_interrupt(&interrupt).await.unwrap();
    let event = InterruptEvent {
        interrupt_id,
        interrupt_type: InterruptType::Abort,
        plan_execution_id: id,
        node_execution_id: None,
    };
    engine
        .queue()
        .publish(Message::encode(&event, None).unwrap(), Duration::ZERO)
        .await
        .unwrap();
    let result = settle(&engine, id).await;

    let interrupt = engine.interrupt(interrupt_id).await.unwrap().unwrap();
    assert_eq!(interrupt.state, InterruptState::Processed);
    assert!(interrupt.rejection.is_none());
    assert!(interrupt.processed_at.is_some());
    assert!(!events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, ExecutionEvent::InterruptRejected { .. })));

    assert_run_status(&result, Status::Aborted);
    assert_eq!(result.node("security").interrupt_history.len(), 1);
}

/// Test the rejections of invalid interrupts
#[tokio::test]
async fn test_rejected_interrupts() {
    let test_engine = TestEngine::new();
    let events = test_engine.events();
    let engine = test_engine.build();
    let (id, result) = start_and_settle(&engine, plan_from_yaml(PARALLEL_WAITS)).await;

    // Finished targets cannot be aborted
    let lint = result.node("lint").id;
    let err = engine
        .submit_interrupt(InterruptType::Abort, id, Some(lint))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Interrupt(InterruptRejection::AlreadyFinished(node)) if node == lint
    ));

    // Nothing is paused
    let err = engine
        .submit_interrupt(InterruptType::Resume, id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Interrupt(InterruptRejection::NotPaused)));

    // Unknown nodes and runs
    let stranger = uuid::Uuid::new_v4();
    let err = engine
        .submit_interrupt(InterruptType::Abort, id, Some(stranger))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Interrupt(InterruptRejection::NodeNotFound(_))));
    let err = engine
        .submit_interrupt(InterruptType::Abort, stranger, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Interrupt(InterruptRejection::RunNotFound(_))));

    // Every rejection is kept, discarded
    let recorded = engine.store().list_interrupts(id).await.unwrap();
    assert_eq!(recorded.len(), 3);
    assert!(recorded.iter().all(|i| i.state == InterruptState::Discarded));
    assert!(recorded.iter().all(|i| i.rejection.is_some()));

    let rejected = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::InterruptRejected { .. }))
        .count();
    assert_eq!(rejected, 4);

    // Nothing changed
    let after = settle(&engine, id).await;
    assert_node_status(&after, "security", Status::Running);
    assert_node_status(&after, "product", Status::Running);
}

/// Test that interrupts against a finished run are rejected
#[tokio::test]
async fn test_interrupt_after_run_finished() {
    let yaml = r#"
id: "p"
name: "Test: Finished"
root: "step"
nodes:
  - id: "step"
    kind: STEP
    step_type: "Noop"
"#;
    let engine = engine();
    let (id, result) = run_plan(&engine, plan_from_yaml(yaml)).await;
    assert_run_status(&result, Status::Succeeded);

    let err = engine
        .submit_interrupt(InterruptType::Abort, id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Interrupt(InterruptRejection::RunFinished(_))));
}
