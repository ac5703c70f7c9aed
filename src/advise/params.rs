//! Parameters of the built-in advisers, decoded from the plan's JSON bytes

use crate::core::failure::FailureType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OnSuccessParams {
    pub next_node_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OnFailParams {
    pub next_node_id: Option<String>,
    pub failure_types: Vec<FailureType>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IgnoreParams {
    /// Empty means every failure type
    pub failure_types: Vec<FailureType>,
    pub next_node_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryParams {
    pub retry_count: u32,
    /// Wait before attempt `n` is the n-th entry; the last entry repeats
    pub wait_intervals_secs: Vec<u64>,
    pub failure_types: Vec<FailureType>,
}

impl RetryParams {
    pub fn wait_for_attempt(&self, attempt: usize) -> u64 {
        self.wait_intervals_secs
            .get(attempt)
            .or_else(|| self.wait_intervals_secs.last())
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManualInterventionParams {
    pub timeout_secs: Option<u64>,
    pub failure_types: Vec<FailureType>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarkSuccessParams {
    pub failure_types: Vec<FailureType>,
    pub next_node_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndPlanParams {
    pub failure_types: Vec<FailureType>,
}
