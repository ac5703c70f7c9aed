//! Test: Strategy Expansion - looping a child once per iteration

use crate::helpers::*;
use pipeline_engine::core::Status;
use pipeline_engine::execution::ExecutionEvent;

fn matrix_plan(iterations: u32, shard_type: &str) -> String {
    format!(
        r#"
id: "tests"
name: "Test: Strategy"
root: "pipeline"
nodes:
  - id: "pipeline"
    kind: PIPELINE
    facilitator: CHILD_CHAIN
    children: ["matrix", "report"]
  - id: "matrix"
    kind: STRATEGY
    facilitator: STRATEGY
    strategy:
      iterations: {}
    children: ["shard"]
  - id: "shard"
    kind: STEP
    step_type: "{}"
  - id: "report"
    kind: STEP
    step_type: "Noop"
"#,
        iterations, shard_type
    )
}

/// Test that every iteration runs with its own strategy metadata
#[tokio::test]
async fn test_iterations_run_in_parallel() {
    let engine = engine();
    let (_, result) = run_plan(&engine, plan_from_yaml(&matrix_plan(3, "Noop"))).await;

    assert_run_status(&result, Status::Succeeded);
    assert_node_status(&result, "matrix", Status::Succeeded);
    assert_node_status(&result, "report", Status::Succeeded);

    let shards = result.executions("shard");
    assert_eq!(shards.len(), 3);
    let mut iterations: Vec<_> = shards
        .iter()
        .map(|n| n.ambiance.current_level().unwrap().strategy.unwrap())
        .map(|s| (s.iteration, s.total))
        .collect();
    iterations.sort_unstable();
    assert_eq!(iterations, vec![(0, 3), (1, 3), (2, 3)]);

    let mut names: Vec<_> = shards.iter().map(|n| n.ambiance.fqn()).collect();
    names.sort();
    assert_eq!(names, vec!["pipeline.shard_0", "pipeline.shard_1", "pipeline.shard_2"]);

    let matrix = result.node("matrix").id;
    assert!(shards.iter().all(|n| n.parent_id == Some(matrix)));
}

/// Test that a strategy with no iterations succeeds right away
#[tokio::test]
async fn test_zero_iterations() {
    let engine = engine();
    let (_, result) = run_plan(&engine, plan_from_yaml(&matrix_plan(0, "Noop"))).await;

    assert_run_status(&result, Status::Succeeded);
    assert_node_status(&result, "matrix", Status::Succeeded);
    assert!(!result.ran("shard"));
    assert_node_status(&result, "report", Status::Succeeded);
}

/// Test that one failed iteration fails the strategy
#[tokio::test]
async fn test_failed_iteration() {
    let engine = TestEngine::new()
        .with_executor(FlakyExecutor::new(1))
        .build();
    let (_, result) = run_plan(&engine, plan_from_yaml(&matrix_plan(4, "Flaky"))).await;

    assert_run_status(&result, Status::Failed);
    assert_node_status(&result, "matrix", Status::Failed);
    let shards = result.executions("shard");
    assert_eq!(shards.len(), 4);
    assert_eq!(shards.iter().filter(|n| n.status == Status::Failed).count(), 1);
    assert!(!result.ran("report"));
}

/// Test that a barrier inside a strategy waits for every iteration
#[tokio::test]
async fn test_barrier_inside_strategy() {
    let yaml = r#"
id: "shards"
name: "Test: Strategy Barrier"
root: "pipeline"
nodes:
  - id: "pipeline"
    kind: PIPELINE
    facilitator: CHILD_CHAIN
    children: ["matrix"]
  - id: "matrix"
    kind: STRATEGY
    facilitator: STRATEGY
    strategy:
      iterations: 3
    children: ["group"]
  - id: "group"
    kind: STEP_GROUP
    facilitator: CHILD_CHAIN
    children: ["prepare", "gate", "finish"]
  - id: "prepare"
    kind: STEP
    step_type: "Noop"
  - id: "gate"
    kind: STEP
    facilitator: ASYNC
    barrier: "all-shards"
  - id: "finish"
    kind: STEP
    step_type: "Noop"
"#;
    let test_engine = TestEngine::new();
    let events = test_engine.events();
    let engine = test_engine.build();
    let (_, result) = run_plan(&engine, plan_from_yaml(yaml)).await;

    assert_run_status(&result, Status::Succeeded);
    assert_eq!(result.executions("gate").len(), 3);
    assert_eq!(result.executions("finish").len(), 3);

    let last_gate_start = result
        .executions("gate")
        .iter()
        .filter_map(|n| n.started_at)
        .max()
        .unwrap();
    assert!(result
        .executions("finish")
        .iter()
        .all(|n| n.started_at.unwrap() >= last_gate_start));

    let released: Vec<_> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::BarrierReleased { released, .. } => Some(*released),
            _ => None,
        })
        .collect();
    assert_eq!(released, vec![3]);
}

/// Test that a retried strategy still reaches a barrier shared with a sibling
#[tokio::test]
async fn test_retried_strategy_meets_barrier() {
    let yaml = r#"
id: "retried"
name: "Test: Retried Strategy Barrier"
root: "pipeline"
nodes:
  - id: "pipeline"
    kind: PIPELINE
    facilitator: CHILDREN
    children: ["matrix", "other"]
  - id: "matrix"
    kind: STRATEGY
    facilitator: STRATEGY
    strategy:
      iterations: 1
    children: ["shard"]
    advisers:
      - type: RETRY
        parameters:
          retry_count: 1
  - id: "shard"
    kind: STEP_GROUP
    facilitator: CHILD_CHAIN
    children: ["flaky", "gate_a"]
  - id: "flaky"
    kind: STEP
    step_type: "Flaky"
  - id: "gate_a"
    kind: STEP
    facilitator: ASYNC
    barrier: "gate"
  - id: "other"
    kind: STAGE
    facilitator: CHILD_CHAIN
    children: ["gate_b"]
  - id: "gate_b"
    kind: STEP
    facilitator: ASYNC
    barrier: "gate"
"#;
    let engine = TestEngine::new()
        .with_executor(FlakyExecutor::new(1))
        .build();
    let (id, result) = run_plan(&engine, plan_from_yaml(yaml)).await;

    assert_run_status(&result, Status::Succeeded);
    let attempts = result.executions("matrix");
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].status, Status::Failed);
    assert_eq!(attempts[1].status, Status::Succeeded);
    assert_node_status(&result, "gate_b", Status::Succeeded);
    assert_eq!(result.executions("gate_a").len(), 1);
    assert_eq!(result.executions("gate_a")[0].status, Status::Succeeded);

    let barrier = &engine.store().list_barriers(id).await.unwrap()[0];
    assert!(barrier.is_down());
    assert_eq!(barrier.outstanding(), 0);
    assert_eq!(barrier.waiting_nodes().len(), 2);
}
