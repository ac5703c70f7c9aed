//! Test: Success Chain - sequential and parallel containers run to completion

use crate::helpers::*;
use pipeline_engine::core::Status;
use pipeline_engine::execution::ExecutionEvent;

const CHAIN: &str = r#"
id: "release"
name: "Test: Success Chain"
root: "pipeline"
nodes:
  - id: "pipeline"
    kind: PIPELINE
    facilitator: CHILD_CHAIN
    children: ["build"]
  - id: "build"
    kind: STAGE
    facilitator: CHILD_CHAIN
    children: ["compile", "package", "publish"]
  - id: "compile"
    kind: STEP
    step_type: "Noop"
  - id: "package"
    kind: STEP
    step_type: "Noop"
  - id: "publish"
    kind: STEP
    step_type: "Noop"
"#;

/// Test that every step of a chain runs once, in order
#[tokio::test]
async fn test_chain_runs_in_order() {
    let engine = engine();
    let (_, result) = run_plan(&engine, plan_from_yaml(CHAIN)).await;

    assert_run_status(&result, Status::Succeeded);
    for id in ["pipeline", "build", "compile", "package", "publish"] {
        assert_node_status(&result, id, Status::Succeeded);
        assert_eq!(result.executions(id).len(), 1, "{} ran more than once", id);
    }

    // Each step continues from its predecessor
    let compile = result.node("compile");
    let package = result.node("package");
    let publish = result.node("publish");
    assert_eq!(package.previous_id, Some(compile.id));
    assert_eq!(publish.previous_id, Some(package.id));
    assert!(compile.ended_at.unwrap() <= package.started_at.unwrap());

    // Siblings share their parent
    let build = result.node("build");
    assert!([compile, package, publish]
        .iter()
        .all(|n| n.parent_id == Some(build.id)));
    assert_eq!(publish.ambiance.fqn(), "pipeline.build.publish");
}

/// Test that parallel children all run and the container waits for them
#[tokio::test]
async fn test_parallel_children() {
    let yaml = r#"
id: "fanout"
name: "Test: Parallel Children"
root: "pipeline"
nodes:
  - id: "pipeline"
    kind: PIPELINE
    facilitator: CHILDREN
    children: ["lint", "unit", "docs"]
  - id: "lint"
    kind: STEP
    step_type: "Noop"
  - id: "unit"
    kind: STEP
    step_type: "Noop"
  - id: "docs"
    kind: STEP
    step_type: "Noop"
"#;
    let engine = engine();
    let (_, result) = run_plan(&engine, plan_from_yaml(yaml)).await;

    assert_run_status(&result, Status::Succeeded);
    let root = result.node("pipeline");
    for id in ["lint", "unit", "docs"] {
        assert_node_status(&result, id, Status::Succeeded);
        assert!(result.node(id).ended_at.unwrap() <= root.ended_at.unwrap());
    }
}

/// Test that an empty container succeeds without children
#[tokio::test]
async fn test_empty_container_succeeds() {
    let yaml = r#"
id: "empty"
name: "Test: Empty"
root: "pipeline"
nodes:
  - id: "pipeline"
    kind: PIPELINE
    facilitator: CHILDREN
"#;
    let engine = engine();
    let (_, result) = run_plan(&engine, plan_from_yaml(yaml)).await;
    assert_run_status(&result, Status::Succeeded);
    assert_eq!(result.nodes.len(), 1);
}

/// Test the lifecycle events reported to handlers
#[tokio::test]
async fn test_run_events() {
    let test_engine = TestEngine::new();
    let events = test_engine.events();
    let engine = test_engine.build();

    let (id, _) = run_plan(&engine, plan_from_yaml(CHAIN)).await;

    let events = events.lock().unwrap();
    assert!(matches!(
        events.first(),
        Some(ExecutionEvent::RunStarted { plan_execution_id, .. }) if *plan_execution_id == id
    ));
    let completed: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::RunCompleted { .. }))
        .collect();
    assert_eq!(completed.len(), 1);
    assert!(matches!(
        completed[0],
        ExecutionEvent::RunCompleted { status: Status::Succeeded, .. }
    ));

    let publish_changes: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::NodeStatusChanged { identifier, from, to, .. } if identifier == "publish" => {
                Some((*from, *to))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        publish_changes,
        vec![(Status::Queued, Status::Running), (Status::Running, Status::Succeeded)]
    );
}

/// Test that status updates can be followed over the broadcast channel
#[tokio::test]
async fn test_status_subscription() {
    let engine = engine();
    let mut updates = engine.subscribe();

    run_plan(&engine, plan_from_yaml(CHAIN)).await;

    let mut seen = 0;
    let mut last_version = std::collections::HashMap::new();
    while let Ok(update) = updates.try_recv() {
        seen += 1;
        assert!(update.from.can_transition_to(update.to));
        // Versions grow per node
        if let Some(previous) = last_version.insert(update.node_execution_id, update.version) {
            assert!(update.version > previous);
        }
    }
    // Queued -> Running -> Succeeded for five nodes
    assert_eq!(seen, 10);
}
