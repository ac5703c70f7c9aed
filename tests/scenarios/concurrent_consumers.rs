//! Test: Concurrent Consumers - the same run driven by one task per topic

use crate::helpers::*;
use pipeline_engine::core::Status;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn wide_plan(branches: usize) -> String {
    let mut yaml = String::from(
        r#"
id: "wide"
name: "Test: Concurrent Consumers"
root: "pipeline"
nodes:
  - id: "pipeline"
    kind: PIPELINE
    facilitator: CHILDREN
    children: ["#,
    );
    let names: Vec<String> = (0..branches).map(|i| format!("\"branch_{}\"", i)).collect();
    yaml.push_str(&names.join(", "));
    yaml.push_str("]\n");

    for i in 0..branches {
        yaml.push_str(&format!(
            r#"  - id: "branch_{i}"
    kind: STAGE
    facilitator: CHILD_CHAIN
    children: ["work_{i}", "sync_{i}"]
  - id: "work_{i}"
    kind: STEP
    step_type: "Noop"
  - id: "sync_{i}"
    kind: STEP
    facilitator: ASYNC
    barrier: "join"
"#
        ));
    }
    yaml
}

/// Test that parallel branches, a shared barrier and container completion
/// stay consistent under concurrent consumers
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_spawned_consumers_finish_run() {
    let engine = Arc::new(
        TestEngine::new()
            .with_config(
                pipeline_engine::EngineConfig::default()
                    .with_idle_poll_interval(Duration::from_millis(2))
                    .with_occ(32, Duration::from_millis(1)),
            )
            .build(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = engine.clone().spawn_consumers(shutdown_rx);

    let id = engine.start_run(plan_from_yaml(&wide_plan(8))).await.unwrap();
    let finished = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let run = engine.run(id).await.unwrap().unwrap();
            if run.is_finished() {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("run finishes");

    shutdown_tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(finished.status, Status::Succeeded);
    let result = snapshot(&engine, id).await;
    assert_eq!(result.nodes.len(), 1 + 8 * 3);
    assert!(result.nodes.iter().all(|n| n.status == Status::Succeeded));
    assert!(result.nodes.iter().all(|n| n.concluded));
}
