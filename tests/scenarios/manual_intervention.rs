//! Test: Manual Intervention - input waits resolved by interrupts or timeouts

use crate::helpers::*;
use pipeline_engine::core::{InterruptState, InterruptType, Status};
use pipeline_engine::execution::{EngineError, InterruptRejection};

fn intervention_plan(step_type: &str, advisers: &str) -> String {
    format!(
        r#"
id: "deploy"
name: "Test: Manual Intervention"
root: "pipeline"
nodes:
  - id: "pipeline"
    kind: PIPELINE
    facilitator: CHILD_CHAIN
    children: ["deploy", "verify"]
  - id: "deploy"
    kind: STEP
    step_type: "{}"
    advisers:
{}
  - id: "verify"
    kind: STEP
    step_type: "Noop"
"#,
        step_type, advisers
    )
}

const WAIT_FOREVER: &str = "      - type: MANUAL_INTERVENTION";

/// Test that a failed step waits for input and the run stalls
#[tokio::test]
async fn test_failure_waits_for_input() {
    let engine = engine();
    let (_, result) = run_plan(&engine, plan_from_yaml(&intervention_plan("Fail", WAIT_FOREVER))).await;

    assert!(!result.run.is_finished());
    let deploy = result.node("deploy");
    assert_eq!(deploy.status, Status::InputWaiting);
    assert_eq!(deploy.status_before_wait, Some(Status::Failed));
    assert!(!result.ran("verify"));
}

/// Test that a mark-success interrupt continues the chain
#[tokio::test]
async fn test_mark_success_interrupt() {
    let engine = engine();
    let (id, result) =
        run_plan(&engine, plan_from_yaml(&intervention_plan("Fail", WAIT_FOREVER))).await;
    let deploy = result.node("deploy").id;

    let interrupt_id = engine
        .submit_interrupt(InterruptType::MarkSuccess, id, Some(deploy))
        .await
        .unwrap();
    engine.run_to_completion(id).await.unwrap();
    let result = snapshot(&engine, id).await;

    assert_run_status(&result, Status::Succeeded);
    assert_node_status(&result, "deploy", Status::Succeeded);
    assert_node_status(&result, "verify", Status::Succeeded);

    let interrupt = engine.interrupt(interrupt_id).await.unwrap().unwrap();
    assert_eq!(interrupt.state, InterruptState::Processed);
    assert!(result
        .node("deploy")
        .interrupt_history
        .iter()
        .any(|e| e.interrupt_id == interrupt_id && e.interrupt_type == InterruptType::MarkSuccess));
}

/// Test that an ignore interrupt absorbs the failure
#[tokio::test]
async fn test_ignore_interrupt() {
    let engine = engine();
    let (id, result) =
        run_plan(&engine, plan_from_yaml(&intervention_plan("Fail", WAIT_FOREVER))).await;

    engine
        .submit_interrupt(InterruptType::Ignore, id, Some(result.node("deploy").id))
        .await
        .unwrap();
    engine.run_to_completion(id).await.unwrap();
    let result = snapshot(&engine, id).await;

    assert_run_status(&result, Status::Succeeded);
    let deploy = result.node("deploy");
    assert_eq!(deploy.status, Status::Failed);
    assert!(deploy.failure_ignored);
    assert_node_status(&result, "verify", Status::Succeeded);
}

/// Test that a retry interrupt starts a new attempt
#[tokio::test]
async fn test_retry_interrupt() {
    let engine = TestEngine::new()
        .with_executor(FlakyExecutor::new(1))
        .build();
    let (id, result) =
        run_plan(&engine, plan_from_yaml(&intervention_plan("Flaky", WAIT_FOREVER))).await;
    let first = result.node("deploy").id;

    engine
        .submit_interrupt(InterruptType::Retry, id, Some(first))
        .await
        .unwrap();
    engine.run_to_completion(id).await.unwrap();
    let result = snapshot(&engine, id).await;

    assert_run_status(&result, Status::Succeeded);
    let attempts = result.executions("deploy");
    assert_eq!(attempts.len(), 2);
    assert!(attempts[0].old_retry);
    assert_eq!(attempts[0].status, Status::Failed);
    assert_eq!(attempts[1].retry_ids, vec![first]);
    assert_eq!(attempts[1].status, Status::Succeeded);
}

/// Test that an expired wait falls through to the next adviser
#[tokio::test(start_paused = true)]
async fn test_intervention_timeout() {
    let advisers = r#"      - type: MANUAL_INTERVENTION
        parameters:
          timeout_secs: 60
      - type: MARK_SUCCESS"#;
    let engine = engine();
    let started = tokio::time::Instant::now();
    let (_, result) = run_plan(&engine, plan_from_yaml(&intervention_plan("Fail", advisers))).await;

    assert!(started.elapsed() >= std::time::Duration::from_secs(60));
    assert_run_status(&result, Status::Succeeded);
    assert_node_status(&result, "deploy", Status::Succeeded);
    assert_node_status(&result, "verify", Status::Succeeded);
}

/// Test that an expired wait without fallback restores the failure
#[tokio::test(start_paused = true)]
async fn test_intervention_timeout_without_fallback() {
    let advisers = r#"      - type: MANUAL_INTERVENTION
        parameters:
          timeout_secs: 5"#;
    let engine = engine();
    let (_, result) = run_plan(&engine, plan_from_yaml(&intervention_plan("Fail", advisers))).await;

    assert_run_status(&result, Status::Failed);
    assert_node_status(&result, "deploy", Status::Failed);
    assert!(!result.ran("verify"));
}

/// Test that interventions need a node that waits for input
#[tokio::test]
async fn test_intervention_rejected_when_not_waiting() {
    let yaml = intervention_plan("Wait", WAIT_FOREVER);
    let engine = engine();
    let (id, result) = start_and_settle(&engine, plan_from_yaml(&yaml)).await;
    let deploy = result.node("deploy");
    assert_eq!(deploy.status, Status::Running);

    let err = engine
        .submit_interrupt(InterruptType::MarkSuccess, id, Some(deploy.id))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Interrupt(InterruptRejection::NotWaitingForInput {
            status: Status::Running
        })
    ));

    let err = engine
        .submit_interrupt(InterruptType::Retry, id, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Interrupt(InterruptRejection::MissingTarget(_))
    ));

    // Rejections leave the node alone
    let result = settle(&engine, id).await;
    assert_node_status(&result, "deploy", Status::Running);
    assert!(result.node("deploy").interrupt_history.is_empty());
}
