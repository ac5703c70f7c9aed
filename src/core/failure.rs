//! Failure information recorded on node executions

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Category of a failure, used by advisers to filter what they act on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    Application,
    Authentication,
    Authorization,
    Connectivity,
    Timeout,
    Verification,
    DelegateProvisioning,
    PolicyEvaluation,
    InputTimeout,
    ApprovalRejection,
    Unknown,
}

/// Why a node did not succeed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,

    #[serde(default)]
    pub failure_types: Vec<FailureType>,

    /// Node execution the failure originated from, once it bubbles up
    #[serde(default)]
    pub origin_node_id: Option<Uuid>,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>, failure_types: Vec<FailureType>) -> Self {
        Self {
            message: message.into(),
            failure_types,
            origin_node_id: None,
        }
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(message, vec![FailureType::Application])
    }

    /// Engine-side failure such as a plan or adviser error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(message, vec![FailureType::Unknown])
    }

    pub fn with_origin(mut self, node_id: Uuid) -> Self {
        if self.origin_node_id.is_none() {
            self.origin_node_id = Some(node_id);
        }
        self
    }

    /// Whether this failure is selected by an adviser's type filter.
    ///
    /// An empty filter selects every failure.
    pub fn matches(&self, filter: &[FailureType]) -> bool {
        filter.is_empty() || self.failure_types.iter().any(|t| filter.contains(t))
    }
}

/// Filter check for nodes that failed without recording failure info
pub fn filter_matches(failure: Option<&FailureInfo>, filter: &[FailureType]) -> bool {
    match failure {
        Some(info) => info.matches(filter),
        None => filter.is_empty() || filter.contains(&FailureType::Unknown),
    }
}
