//! Persisted record of one node's lifecycle within a run

use crate::advise::AdviserResponse;
use crate::core::ambiance::{Ambiance, NodeKind};
use crate::core::failure::FailureInfo;
use crate::core::interrupt::InterruptType;
use crate::core::status::Status;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Result reported by a step executor, or synthesised for containers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub status: Status,

    #[serde(default)]
    pub outputs: Map<String, Value>,

    #[serde(default)]
    pub failure: Option<FailureInfo>,
}

impl StepOutcome {
    pub fn succeeded(outputs: Map<String, Value>) -> Self {
        Self {
            status: Status::Succeeded,
            outputs,
            failure: None,
        }
    }

    pub fn failed(failure: FailureInfo) -> Self {
        Self::with_status(Status::Failed, failure)
    }

    pub fn with_status(status: Status, failure: FailureInfo) -> Self {
        Self {
            status,
            outputs: Map::new(),
            failure: Some(failure),
        }
    }
}

/// Interrupt that touched a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptEffect {
    pub interrupt_id: Uuid,
    pub interrupt_type: InterruptType,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    /// Also the runtime id of the last ambiance level
    pub id: Uuid,
    pub plan_execution_id: Uuid,
    pub ambiance: Ambiance,

    /// Plan node (setup) id
    pub plan_node_id: String,
    pub identifier: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub step_type: String,

    pub status: Status,
    pub parent_id: Option<Uuid>,
    pub previous_id: Option<Uuid>,

    #[serde(default)]
    pub step_parameters: Value,
    #[serde(default)]
    pub resolved_parameters: Option<Value>,

    /// Earlier attempts of the same plan node, oldest first
    #[serde(default)]
    pub retry_ids: Vec<Uuid>,
    #[serde(default)]
    pub old_retry: bool,

    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub failure_ignored: bool,
    #[serde(default)]
    pub adviser_response: Option<AdviserResponse>,
    #[serde(default)]
    pub outputs: Map<String, Value>,

    #[serde(default)]
    pub delegated_task_id: Option<String>,
    /// Step outcome that arrived while the node was pausing
    #[serde(default)]
    pub held_response: Option<StepOutcome>,
    /// Failure status to restore when a manual intervention is resolved
    #[serde(default)]
    pub status_before_wait: Option<Status>,
    /// Completion was handed to the parent or a successor
    #[serde(default)]
    pub concluded: bool,
    #[serde(default)]
    pub interrupt_history: Vec<InterruptEffect>,

    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_updated_at: DateTime<Utc>,
}

impl NodeExecution {
    /// New QUEUED record; the id is taken from the ambiance's current level
    pub fn new(
        ambiance: Ambiance,
        plan_node_id: impl Into<String>,
        identifier: impl Into<String>,
        kind: NodeKind,
    ) -> Self {
        let now = Utc::now();
        let id = ambiance.current_runtime_id().unwrap_or_else(Uuid::new_v4);
        let parent_id = ambiance.parent_runtime_id();
        let step_type = ambiance.current_step_type().unwrap_or_default().to_string();
        Self {
            id,
            plan_execution_id: ambiance.plan_execution_id,
            plan_node_id: plan_node_id.into(),
            identifier: identifier.into(),
            kind,
            step_type,
            status: Status::Queued,
            parent_id,
            previous_id: None,
            step_parameters: Value::Null,
            resolved_parameters: None,
            retry_ids: Vec::new(),
            old_retry: false,
            failure_info: None,
            failure_ignored: false,
            adviser_response: None,
            outputs: Map::new(),
            delegated_task_id: None,
            held_response: None,
            status_before_wait: None,
            concluded: false,
            interrupt_history: Vec::new(),
            version: 0,
            created_at: now,
            started_at: None,
            ended_at: None,
            last_updated_at: now,
            ambiance,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.step_parameters = parameters;
        self
    }

    pub fn with_previous(mut self, previous_id: Option<Uuid>) -> Self {
        self.previous_id = previous_id;
        self
    }

    pub fn with_retry_ids(mut self, retry_ids: Vec<Uuid>) -> Self {
        self.retry_ids = retry_ids;
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }

    /// Counts as a success for the parent
    pub fn is_absorbed(&self) -> bool {
        self.status.is_success() || (self.status.is_failure() && self.failure_ignored)
    }

    pub fn has_started(&self) -> bool {
        self.started_at.is_some()
    }

    /// Apply a finished outcome to the record
    pub fn apply_outcome(&mut self, outcome: &StepOutcome) {
        self.status = outcome.status;
        self.outputs.extend(outcome.outputs.clone());
        self.failure_info = outcome
            .failure
            .clone()
            .map(|f| f.with_origin(self.id));
        self.ended_at = Some(Utc::now());
    }

    pub fn record_interrupt(&mut self, interrupt_id: Uuid, interrupt_type: InterruptType) {
        self.interrupt_history.push(InterruptEffect {
            interrupt_id,
            interrupt_type,
            applied_at: Utc::now(),
        });
    }
}
