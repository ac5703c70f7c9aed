//! Test: Step Execution - delegated tasks, timeouts and unreachable workers

use crate::helpers::*;
use pipeline_engine::core::{FailureType, Status, StepOutcome};
use pipeline_engine::execution::EngineConfig;
use pipeline_engine::FailureInfo;
use std::time::Duration;

fn single_step(step_type: &str, facilitator: &str) -> String {
    format!(
        r#"
id: "single"
name: "Test: Step Execution"
root: "pipeline"
nodes:
  - id: "pipeline"
    kind: PIPELINE
    facilitator: CHILD_CHAIN
    children: ["work"]
  - id: "work"
    kind: STEP
    facilitator: {}
    step_type: "{}"
"#,
        facilitator, step_type
    )
}

/// Test that a delegated task completes through a task response
#[tokio::test]
async fn test_delegated_task() {
    let engine = TestEngine::new().with_executor(DelegatingExecutor).build();
    let (id, result) = run_plan(&engine, plan_from_yaml(&single_step("Delegate", "TASK"))).await;

    assert!(!result.run.is_finished());
    let work = result.node("work");
    assert_eq!(work.status, Status::Running);
    assert_eq!(work.delegated_task_id, Some(format!("task-{}", work.id)));

    let mut outputs = serde_json::Map::new();
    outputs.insert("exit_code".into(), serde_json::json!(0));
    engine
        .submit_task_response(work.id, StepOutcome::succeeded(outputs))
        .await
        .unwrap();
    engine.run_to_completion(id).await.unwrap();
    let result = snapshot(&engine, id).await;

    assert_run_status(&result, Status::Succeeded);
    assert_eq!(result.node("work").outputs["exit_code"], serde_json::json!(0));
}

/// Test that a failed task response is advised like any failure
#[tokio::test]
async fn test_failed_task_response() {
    let engine = engine();
    let (id, result) = run_plan(&engine, plan_from_yaml(&single_step("Wait", "ASYNC"))).await;

    let failure = FailureInfo::new("approval rejected", vec![FailureType::ApprovalRejection]);
    engine
        .submit_task_response(
            result.node("work").id,
            StepOutcome::with_status(Status::Rejected, failure),
        )
        .await
        .unwrap();
    engine.run_to_completion(id).await.unwrap();
    let result = snapshot(&engine, id).await;

    assert_run_status(&result, Status::Rejected);
    let failure = result.run.failure_info.as_ref().unwrap();
    assert_eq!(failure.failure_types, vec![FailureType::ApprovalRejection]);
    assert_eq!(failure.origin_node_id, Some(result.node("work").id));
}

/// Test that a response with a non-final status errors the node
#[tokio::test]
async fn test_non_final_response() {
    let engine = engine();
    let (id, result) = run_plan(&engine, plan_from_yaml(&single_step("Wait", "ASYNC"))).await;

    let mut outcome = succeeded();
    outcome.status = Status::Paused;
    engine
        .submit_task_response(result.node("work").id, outcome)
        .await
        .unwrap();
    engine.run_to_completion(id).await.unwrap();

    let result = snapshot(&engine, id).await;
    assert_node_status(&result, "work", Status::Errored);
    assert_run_status(&result, Status::Errored);
}

/// Test that a step running past the timeout expires
#[tokio::test(start_paused = true)]
async fn test_step_timeout() {
    let engine = TestEngine::new()
        .with_config(EngineConfig::default().with_step_timeout(Duration::from_secs(5)))
        .with_executor(SlowExecutor::new(Duration::from_secs(60)))
        .build();
    let (_, result) = run_plan(&engine, plan_from_yaml(&single_step("Slow", "SYNC"))).await;

    assert_run_status(&result, Status::Expired);
    let work = result.node("work");
    assert_eq!(work.status, Status::Expired);
    assert_eq!(
        work.failure_info.as_ref().unwrap().failure_types,
        vec![FailureType::Timeout]
    );
}

/// Test that transient executor errors are redelivered
#[tokio::test(start_paused = true)]
async fn test_transient_errors_redelivered() {
    let engine = TestEngine::new()
        .with_executor(UnreachableExecutor::new(2))
        .build();
    let (_, result) = run_plan(&engine, plan_from_yaml(&single_step("Unreachable", "SYNC"))).await;

    assert_run_status(&result, Status::Succeeded);
    assert_eq!(result.executions("work").len(), 1);
}

/// Test that a worker that stays unreachable errors the node
#[tokio::test(start_paused = true)]
async fn test_transient_errors_exhausted() {
    let engine = TestEngine::new()
        .with_config(EngineConfig::default().with_redelivery(Duration::from_millis(10), 3))
        .with_executor(UnreachableExecutor::new(10))
        .build();
    let (_, result) = run_plan(&engine, plan_from_yaml(&single_step("Unreachable", "SYNC"))).await;

    assert_run_status(&result, Status::Errored);
    let work = result.node("work");
    assert_eq!(
        work.failure_info.as_ref().unwrap().failure_types,
        vec![FailureType::Connectivity]
    );
}

/// Test that giving up on a stalled run errors every active node
#[tokio::test]
async fn test_error_out_stalled_run() {
    let engine = engine();
    let (id, result) = run_plan(&engine, plan_from_yaml(&single_step("Wait", "ASYNC"))).await;
    assert!(!result.run.is_finished());

    let changed = engine.error_out_run(id, "gave up").await.unwrap();
    assert_eq!(changed, 2);

    let result = snapshot(&engine, id).await;
    assert_run_status(&result, Status::Errored);
    assert_node_status(&result, "work", Status::Errored);
    assert_eq!(result.run.failure_info.as_ref().unwrap().message, "gave up");
}
