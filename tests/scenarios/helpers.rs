//! Test utility functions for engine scenarios

use async_trait::async_trait;
use pipeline_engine::core::config::PlanConfig;
use pipeline_engine::core::{NodeExecution, Plan, RunRecord, Status, StepOutcome};
use pipeline_engine::execution::{
    Engine, EngineConfig, ExecutionEvent, InMemoryQueue, StepContext, StepError, StepExecutor,
    StepResponse,
};
use pipeline_engine::persistence::InMemoryStore;
use serde_json::Map;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub fn plan_from_yaml(yaml: &str) -> Plan {
    PlanConfig::from_yaml(yaml)
        .expect("valid plan document")
        .to_plan()
        .expect("plan compiles")
}

/// Engine over in-memory store and queue, with the built-in step types
pub fn engine() -> Engine {
    TestEngine::new().build()
}

/// Builder wrapper collecting the engine's events
pub struct TestEngine {
    config: EngineConfig,
    executors: Vec<Arc<dyn StepExecutor>>,
    events: Arc<Mutex<Vec<ExecutionEvent>>>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default().with_redelivery(Duration::from_millis(10), 5),
            executors: Vec::new(),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_executor(mut self, executor: impl StepExecutor + 'static) -> Self {
        self.executors.push(Arc::new(executor));
        self
    }

    pub fn events(&self) -> Arc<Mutex<Vec<ExecutionEvent>>> {
        self.events.clone()
    }

    pub fn build(self) -> Engine {
        let events = self.events.clone();
        let mut builder = Engine::builder(Arc::new(InMemoryStore::new()), Arc::new(InMemoryQueue::new()))
            .with_config(self.config)
            .with_event_handler(move |event| events.lock().unwrap().push(event));
        for executor in self.executors {
            builder = builder.with_executor(executor);
        }
        builder.build()
    }
}

/// Run and node executions at one point in time
#[derive(Debug)]
pub struct RunSnapshot {
    pub run: RunRecord,
    pub nodes: Vec<NodeExecution>,
}

impl RunSnapshot {
    pub fn status(&self) -> Status {
        self.run.status
    }

    /// Every execution of a plan node, attempts and iterations included
    pub fn executions(&self, plan_node_id: &str) -> Vec<&NodeExecution> {
        let mut found: Vec<_> = self
            .nodes
            .iter()
            .filter(|n| n.plan_node_id == plan_node_id)
            .collect();
        found.sort_by_key(|n| n.retry_ids.len());
        found
    }

    /// The execution that was not replaced by a retry
    pub fn node(&self, plan_node_id: &str) -> &NodeExecution {
        self.nodes
            .iter()
            .find(|n| n.plan_node_id == plan_node_id && !n.old_retry)
            .unwrap_or_else(|| panic!("node '{}' never ran\n{}", plan_node_id, self.summary()))
    }

    pub fn node_status(&self, plan_node_id: &str) -> Status {
        self.node(plan_node_id).status
    }

    pub fn ran(&self, plan_node_id: &str) -> bool {
        self.nodes.iter().any(|n| n.plan_node_id == plan_node_id)
    }

    pub fn summary(&self) -> String {
        let mut lines = vec![format!("run {}", self.run.status)];
        for node in &self.nodes {
            lines.push(format!(
                "  {} {}{}{}",
                node.ambiance.fqn(),
                node.status,
                if node.old_retry { " (retried)" } else { "" },
                if node.failure_ignored { " (ignored)" } else { "" }
            ));
        }
        lines.join("\n")
    }
}

pub async fn snapshot(engine: &Engine, plan_execution_id: Uuid) -> RunSnapshot {
    let run = engine
        .run(plan_execution_id)
        .await
        .unwrap()
        .expect("run exists");
    let nodes = engine.nodes(plan_execution_id).await.unwrap();
    RunSnapshot { run, nodes }
}

/// Start a plan and pump until it finishes or stalls
pub async fn run_plan(engine: &Engine, plan: Plan) -> (Uuid, RunSnapshot) {
    let id = engine.start_run(plan).await.unwrap();
    engine.run_to_completion(id).await.unwrap();
    (id, snapshot(engine, id).await)
}

/// Start a plan and handle every message that is due right now
pub async fn start_and_settle(engine: &Engine, plan: Plan) -> (Uuid, RunSnapshot) {
    let id = engine.start_run(plan).await.unwrap();
    engine.run_until_idle().await.unwrap();
    (id, snapshot(engine, id).await)
}

pub async fn settle(engine: &Engine, plan_execution_id: Uuid) -> RunSnapshot {
    engine.run_until_idle().await.unwrap();
    snapshot(engine, plan_execution_id).await
}

pub fn assert_run_status(snapshot: &RunSnapshot, expected: Status) {
    assert_eq!(
        snapshot.status(),
        expected,
        "unexpected run status\n{}",
        snapshot.summary()
    );
}

pub fn assert_node_status(snapshot: &RunSnapshot, plan_node_id: &str, expected: Status) {
    assert_eq!(
        snapshot.node_status(plan_node_id),
        expected,
        "unexpected status of '{}'\n{}",
        plan_node_id,
        snapshot.summary()
    );
}

pub fn succeeded() -> StepOutcome {
    StepOutcome::succeeded(Map::new())
}

/// Fails a fixed number of times, then succeeds
pub struct FlakyExecutor {
    failures: usize,
    calls: Arc<AtomicUsize>,
}

impl FlakyExecutor {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl StepExecutor for FlakyExecutor {
    fn step_type(&self) -> &str {
        "Flaky"
    }

    async fn execute(&self, _ctx: &StepContext) -> Result<StepResponse, StepError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(StepError::Failed(
                pipeline_engine::FailureInfo::application(format!("attempt {} failed", call + 1)),
            ));
        }
        Ok(StepResponse::Completed(succeeded()))
    }
}

/// Reports a transient error on the first deliveries
pub struct UnreachableExecutor {
    outages: u32,
}

impl UnreachableExecutor {
    pub fn new(outages: u32) -> Self {
        Self { outages }
    }
}

#[async_trait]
impl StepExecutor for UnreachableExecutor {
    fn step_type(&self) -> &str {
        "Unreachable"
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepResponse, StepError> {
        if ctx.attempt <= self.outages {
            return Err(StepError::Transient(format!("worker offline (delivery {})", ctx.attempt)));
        }
        Ok(StepResponse::Completed(succeeded()))
    }
}

/// Sleeps before succeeding
pub struct SlowExecutor {
    duration: Duration,
}

impl SlowExecutor {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl StepExecutor for SlowExecutor {
    fn step_type(&self) -> &str {
        "Slow"
    }

    async fn execute(&self, _ctx: &StepContext) -> Result<StepResponse, StepError> {
        tokio::time::sleep(self.duration).await;
        Ok(StepResponse::Completed(succeeded()))
    }
}

/// Hands the step to an external worker
pub struct DelegatingExecutor;

#[async_trait]
impl StepExecutor for DelegatingExecutor {
    fn step_type(&self) -> &str {
        "Delegate"
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepResponse, StepError> {
        Ok(StepResponse::Delegated {
            task_id: format!("task-{}", ctx.node_execution_id),
        })
    }
}
