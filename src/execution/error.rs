//! Engine error types

use crate::advise::AdviserError;
use crate::core::{IllegalTransition, PlanError, ResolutionError, Status};
use crate::execution::queue::QueueError;
use crate::persistence::StoreError;
use thiserror::Error;
use uuid::Uuid;

/// Why an interrupt was refused; the run is left untouched
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterruptRejection {
    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("run {0} has already finished")]
    RunFinished(Uuid),

    #[error("node execution {0} not found in this run")]
    NodeNotFound(Uuid),

    #[error("node execution {0} has already finished")]
    AlreadyFinished(Uuid),

    #[error("nothing is paused in the targeted scope")]
    NotPaused,

    #[error("node is {status}, expected INPUT_WAITING")]
    NotWaitingForInput { status: Status },

    #[error("{0} interrupts need a target node execution")]
    MissingTarget(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Adviser(#[from] AdviserError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("interrupt rejected: {0}")]
    Interrupt(#[from] InterruptRejection),

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error("invalid plan: {0}")]
    InvalidPlan(#[from] PlanError),

    #[error("plan error: {0}")]
    Plan(String),

    #[error("gave up updating {kind} {id} after {attempts} conflicting writes")]
    ConflictRetriesExhausted {
        kind: &'static str,
        id: String,
        attempts: usize,
    },

    #[error("step executor unavailable: {0}")]
    StepUnavailable(String),

    #[error("run {0} not found")]
    UnknownRun(Uuid),

    #[error("node execution {0} not found")]
    NodeNotFound(Uuid),
}

impl EngineError {
    /// Infrastructure failures worth redelivering the message for
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Store(e) => e.is_transient(),
            EngineError::Queue(e) => e.is_transient(),
            EngineError::ConflictRetriesExhausted { .. } | EngineError::StepUnavailable(_) => true,
            _ => false,
        }
    }
}
