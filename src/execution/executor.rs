//! Step executors: the pluggable code that runs leaf steps

use crate::core::{Ambiance, FailureInfo, FailureType, Status, StepOutcome};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// What a step executor gets to work with
#[derive(Debug, Clone)]
pub struct StepContext {
    pub node_execution_id: Uuid,
    pub ambiance: Ambiance,
    /// Parameters with expressions already resolved
    pub parameters: Value,
    /// Delivery attempt of the facilitate message, starting at 1
    pub attempt: u32,
}

/// Result of executing a step
#[derive(Debug, Clone, PartialEq)]
pub enum StepResponse {
    /// Finished inline
    Completed(StepOutcome),
    /// Handed to an external worker; completed by a task response
    Delegated { task_id: String },
    /// Parked until something calls back
    Waiting,
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error("step failed: {}", .0.message)]
    Failed(FailureInfo),

    /// Infrastructure problem; the step is attempted again
    #[error("step temporarily unavailable: {0}")]
    Transient(String),
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Step type this executor handles
    fn step_type(&self) -> &str;

    async fn execute(&self, ctx: &StepContext) -> Result<StepResponse, StepError>;
}

/// Executors by step type
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `Noop`, `Fail` and `Wait` step types
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(NoopExecutor));
        registry.register(Arc::new(FailExecutor));
        registry.register(Arc::new(WaitExecutor));
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn StepExecutor>) {
        self.executors
            .insert(executor.step_type().to_string(), executor);
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(step_type).cloned()
    }

    pub fn step_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.executors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

/// Succeeds immediately; `outputs` in the parameters become the step outputs
pub struct NoopExecutor;

#[async_trait]
impl StepExecutor for NoopExecutor {
    fn step_type(&self) -> &str {
        "Noop"
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepResponse, StepError> {
        let outputs = ctx
            .parameters
            .get("outputs")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_else(Map::new);
        debug!("Noop step {} produced {} outputs", ctx.node_execution_id, outputs.len());
        Ok(StepResponse::Completed(StepOutcome::succeeded(outputs)))
    }
}

/// Always fails, with the `message`, `failure_types` and `status` parameters
pub struct FailExecutor;

#[async_trait]
impl StepExecutor for FailExecutor {
    fn step_type(&self) -> &str {
        "Fail"
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepResponse, StepError> {
        let params = &ctx.parameters;
        let message = params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("step failed");
        let failure_types = params
            .get("failure_types")
            .cloned()
            .and_then(|v| serde_json::from_value::<Vec<FailureType>>(v).ok())
            .unwrap_or_else(|| vec![FailureType::Application]);
        let status = params
            .get("status")
            .and_then(Value::as_str)
            .and_then(Status::parse)
            .filter(|s| s.is_failure())
            .unwrap_or(Status::Failed);

        Ok(StepResponse::Completed(StepOutcome::with_status(
            status,
            FailureInfo::new(message, failure_types),
        )))
    }
}

/// Parks the node until a task response arrives
pub struct WaitExecutor;

#[async_trait]
impl StepExecutor for WaitExecutor {
    fn step_type(&self) -> &str {
        "Wait"
    }

    async fn execute(&self, _ctx: &StepContext) -> Result<StepResponse, StepError> {
        Ok(StepResponse::Waiting)
    }
}
