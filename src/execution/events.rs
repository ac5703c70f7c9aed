//! Queue payloads and engine notifications

use crate::advise::{AdviseType, AdviserType};
use crate::core::schema;
use crate::core::{Ambiance, FacilitatorType, FailureInfo, InterruptType, Status, StepOutcome};
use crate::execution::queue::{Payload, Topic};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Start a queued node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStartEvent {
    pub node_execution_id: Uuid,
    pub ambiance: Ambiance,
}

impl Payload for NodeStartEvent {
    const TOPIC: Topic = Topic::NodeStart;
    const SCHEMA_ID: u32 = schema::NODE_START_EVENT;
}

/// Execute a started node according to its facilitator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilitatorEvent {
    pub node_execution_id: Uuid,
    pub ambiance: Ambiance,
    pub facilitator: FacilitatorType,
    pub step_type: String,
    /// Parameters after expression resolution
    pub step_parameters: Value,
    pub notify_id: String,
    /// Children of container nodes
    #[serde(default)]
    pub ref_objects: Vec<String>,
}

impl Payload for FacilitatorEvent {
    const TOPIC: Topic = Topic::Facilitate;
    const SCHEMA_ID: u32 = schema::FACILITATOR_EVENT;
}

/// Ask a finished node's advisers what happens next
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviseEvent {
    pub node_execution_id: Uuid,
    pub from_status: Status,
    pub to_status: Status,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub retry_ids: Vec<Uuid>,
    /// The manual intervention wait of this node timed out
    #[serde(default)]
    pub previous_adviser_expired: bool,
    /// Decision forced by an intervention interrupt instead of the chain
    #[serde(default)]
    pub manual: Option<AdviseType>,
}

impl Payload for AdviseEvent {
    const TOPIC: Topic = Topic::NodeAdvise;
    const SCHEMA_ID: u32 = schema::ADVISE_EVENT;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptEvent {
    pub interrupt_id: Uuid,
    pub interrupt_type: InterruptType,
    pub plan_execution_id: Uuid,
    #[serde(default)]
    pub node_execution_id: Option<Uuid>,
}

impl Payload for InterruptEvent {
    const TOPIC: Topic = Topic::Interrupt;
    const SCHEMA_ID: u32 = schema::INTERRUPT_EVENT;
}

/// Responses flowing back into the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SdkResponseEvent {
    /// A step finished (inline, delegated task, or barrier release)
    StepResponse {
        node_execution_id: Uuid,
        outcome: StepOutcome,
    },
    /// A child of a container finished and handed control back
    ChildEnded { parent_id: Uuid, child_id: Uuid },
}

impl Payload for SdkResponseEvent {
    const TOPIC: Topic = Topic::SdkResponse;
    const SCHEMA_ID: u32 = schema::SDK_RESPONSE_EVENT;
}

/// Notifications emitted to engine event handlers
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    RunStarted {
        plan_execution_id: Uuid,
        plan_id: String,
    },
    NodeStatusChanged {
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        identifier: String,
        from: Status,
        to: Status,
    },
    AdviserDecision {
        node_execution_id: Uuid,
        /// None for decisions forced by an interrupt
        adviser: Option<AdviserType>,
        advise_type: AdviseType,
    },
    BarrierReleased {
        plan_execution_id: Uuid,
        identifier: String,
        released: usize,
    },
    InterruptProcessed {
        interrupt_id: Uuid,
        interrupt_type: InterruptType,
    },
    InterruptRejected {
        interrupt_id: Uuid,
        interrupt_type: InterruptType,
        reason: String,
    },
    RunCompleted {
        plan_execution_id: Uuid,
        status: Status,
        failure_info: Option<FailureInfo>,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;
