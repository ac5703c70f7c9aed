//! pipeline-engine - An event-driven execution engine for compiled pipeline plans

pub mod advise;
pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;

// Re-export commonly used types
pub use crate::advise::{AdviseType, AdviserObtainment, AdviserResponse, AdviserType};
pub use crate::core::{
    Ambiance, FailureInfo, FailureType, InterruptType, Level, NodeExecution, Plan, PlanNode,
    RunRecord, Status, StepOutcome,
};
pub use crate::execution::{Engine, EngineConfig, EngineError, ExecutionEvent, StepExecutor};
pub use crate::persistence::{ExecutionStore, InMemoryStore};
