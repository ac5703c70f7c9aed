//! Adviser decisions

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of decision, used to pick the handler that applies it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviseType {
    NextStep,
    Retry,
    InterventionWait,
    EndPlan,
    MarkSuccess,
    Ignore,
    /// Sent by a newer producer; has no handler
    #[serde(other)]
    Unknown,
}

/// Decision taken by an adviser for one node execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviserResponse {
    NextStep {
        #[serde(default)]
        next_node_id: Option<String>,
    },
    Retry {
        wait_secs: u64,
        /// Prior attempts, oldest first
        retry_ids: Vec<Uuid>,
    },
    InterventionWait {
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    Ignore {
        #[serde(default)]
        next_node_id: Option<String>,
    },
    MarkSuccess {
        #[serde(default)]
        next_node_id: Option<String>,
    },
    EndPlan,
}

impl AdviserResponse {
    pub fn advise_type(&self) -> AdviseType {
        match self {
            AdviserResponse::NextStep { .. } => AdviseType::NextStep,
            AdviserResponse::Retry { .. } => AdviseType::Retry,
            AdviserResponse::InterventionWait { .. } => AdviseType::InterventionWait,
            AdviserResponse::Ignore { .. } => AdviseType::Ignore,
            AdviserResponse::MarkSuccess { .. } => AdviseType::MarkSuccess,
            AdviserResponse::EndPlan => AdviseType::EndPlan,
        }
    }

    /// Sibling to continue with, for decisions that move forward
    pub fn next_node_id(&self) -> Option<&str> {
        match self {
            AdviserResponse::NextStep { next_node_id }
            | AdviserResponse::Ignore { next_node_id }
            | AdviserResponse::MarkSuccess { next_node_id } => next_node_id.as_deref(),
            _ => None,
        }
    }
}
