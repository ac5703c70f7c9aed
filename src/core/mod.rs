//! Core domain models for the execution engine
//!
//! This module defines the documents the engine persists (node executions,
//! barriers, interrupts, runs), the compiled plan it consumes, and the pure
//! pieces of logic over them: the status graph and expression evaluation.

pub mod ambiance;
pub mod barrier;
pub mod config;
pub mod expression;
pub mod failure;
pub mod interrupt;
pub mod node_execution;
pub mod plan;
pub mod run;
pub mod schema;
pub mod status;

pub use ambiance::{Ambiance, Level, NodeKind, StrategyMetadata};
pub use barrier::{BarrierInstance, BarrierSetupInfo, BarrierState};
pub use expression::{ExpressionEvaluator, ResolutionError, ResolveMode};
pub use failure::{FailureInfo, FailureType};
pub use interrupt::{Interrupt, InterruptState, InterruptType};
pub use node_execution::{NodeExecution, StepOutcome};
pub use plan::{FacilitatorType, Plan, PlanError, PlanNode};
pub use run::{RunRecord, RunSummary};
pub use status::{IllegalTransition, Status};
