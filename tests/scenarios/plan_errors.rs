//! Test: Plan Errors - broken plans fail the node they surface on

use crate::helpers::*;
use pipeline_engine::advise::{AdviserObtainment, AdviserType};
use pipeline_engine::core::{FacilitatorType, NodeKind, Plan, PlanError, PlanNode, Status};
use pipeline_engine::execution::{Engine, EngineError, InMemoryQueue};
use pipeline_engine::persistence::{InMemoryStore, RunStore};
use std::sync::Arc;
use uuid::Uuid;

const GATED: &str = r#"
id: "gated"
name: "Test: Plan Errors"
root: "pipeline"
nodes:
  - id: "pipeline"
    kind: PIPELINE
    facilitator: CHILD_CHAIN
    children: ["gate", "release"]
  - id: "gate"
    kind: STEP
    facilitator: ASYNC
    step_type: "Wait"
  - id: "release"
    kind: STAGE
    facilitator: CHILD_CHAIN
    children: ["deploy"]
  - id: "deploy"
    kind: STEP
    step_type: "Noop"
"#;

/// Start the gated plan on a shared store and queue; the run stops at the gate
async fn start_gated() -> (Arc<InMemoryStore>, Arc<InMemoryQueue>, Uuid, Uuid) {
    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(InMemoryQueue::new());
    let engine = Engine::builder(store.clone(), queue.clone()).build();
    let (id, result) = run_plan(&engine, plan_from_yaml(GATED)).await;
    assert_node_status(&result, "gate", Status::Running);
    (store, queue, id, result.node("gate").id)
}

/// Replace the stored plan of a run, as a newer engine would find it
async fn edit_plan(store: &InMemoryStore, id: Uuid, edit: impl FnOnce(&mut Plan)) {
    let mut run = store.get_run(id).await.unwrap().unwrap();
    edit(&mut run.plan);
    store.update_run(&run).await.unwrap();
}

/// Test that a programmatic plan is checked before anything is stored
#[tokio::test]
async fn test_invalid_plan_rejected_at_start() {
    let route = AdviserObtainment::with_parameters(
        AdviserType::OnSuccess,
        &serde_json::json!({ "next_node_id": "missing" }),
    )
    .unwrap();
    let plan = Plan::new("broken", "Test: Broken Route", "pipeline")
        .with_node(
            PlanNode::new("pipeline", NodeKind::Pipeline, FacilitatorType::ChildChain)
                .with_children(&["a"]),
        )
        .with_node(
            PlanNode::new("a", NodeKind::Step, FacilitatorType::Sync)
                .with_step_type("Noop")
                .with_adviser(route),
        );

    let engine = engine();
    let err = engine.start_run(plan).await.unwrap_err();
    assert!(
        matches!(
            err,
            EngineError::InvalidPlan(PlanError::RouteNotSibling { ref target, .. }) if target == "missing"
        ),
        "{}",
        err
    );
    assert!(engine.store().list_runs(10).await.unwrap().is_empty());
}

/// Test that a missing successor fails the chain instead of stalling the run
#[tokio::test]
async fn test_missing_successor_fails_container() {
    let (store, queue, id, gate_id) = start_gated().await;
    edit_plan(&store, id, |plan| {
        plan.nodes.remove("release");
        plan.nodes.get_mut("pipeline").unwrap().children = vec!["gate".to_string()];
    })
    .await;

    let engine = Engine::builder(store, queue).build();
    engine.submit_task_response(gate_id, succeeded()).await.unwrap();
    engine.run_to_completion(id).await.unwrap();
    let result = snapshot(&engine, id).await;

    assert!(result.run.is_finished(), "{}", result.summary());
    assert_run_status(&result, Status::Errored);
    assert_node_status(&result, "gate", Status::Succeeded);
    assert!(result.node("gate").concluded);
    assert_node_status(&result, "pipeline", Status::Errored);
    assert!(!result.ran("release"));

    let failure = result.run.failure_info.as_ref().unwrap();
    assert!(failure.message.contains("release"), "{}", failure.message);
    assert_eq!(failure.origin_node_id, Some(result.node("pipeline").id));
}

/// Test that a container missing its child errors while running
#[tokio::test]
async fn test_missing_child_errors_node() {
    let (store, queue, id, gate_id) = start_gated().await;
    edit_plan(&store, id, |plan| {
        plan.nodes.remove("deploy");
    })
    .await;

    let engine = Engine::builder(store, queue).build();
    engine.submit_task_response(gate_id, succeeded()).await.unwrap();
    engine.run_to_completion(id).await.unwrap();
    let result = snapshot(&engine, id).await;

    assert_run_status(&result, Status::Errored);
    let release = result.node("release");
    assert_eq!(release.status, Status::Errored);
    assert!(release.started_at.is_some());
    let failure = release.failure_info.as_ref().unwrap();
    assert!(failure.message.contains("deploy"), "{}", failure.message);
    assert_eq!(failure.origin_node_id, Some(release.id));
    assert!(!result.ran("deploy"));
}
