//! Run-level record of a plan execution

use crate::core::failure::FailureInfo;
use crate::core::plan::Plan;
use crate::core::status::Status;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub plan_execution_id: Uuid,
    pub plan: Plan,
    pub status: Status,
    pub root_node_id: Uuid,

    /// First failure that reached the root without being absorbed
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,

    /// Node executions under an active pause; nodes inside start PAUSED
    #[serde(default)]
    pub pause_scopes: BTreeSet<Uuid>,

    pub version: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn new(plan_execution_id: Uuid, plan: Plan, root_node_id: Uuid) -> Self {
        Self {
            plan_execution_id,
            plan,
            status: Status::Running,
            root_node_id,
            failure_info: None,
            pause_scopes: BTreeSet::new(),
            version: 0,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn finish(&mut self, status: Status, failure_info: Option<FailureInfo>) {
        self.status = status;
        self.failure_info = failure_info;
        self.pause_scopes.clear();
        self.ended_at = Some(Utc::now());
    }

    /// Whether any pause scope covers a node with the given level chain
    pub fn is_paused_for(&self, runtime_ids: impl IntoIterator<Item = Uuid>) -> bool {
        !self.pause_scopes.is_empty()
            && runtime_ids
                .into_iter()
                .any(|id| self.pause_scopes.contains(&id))
    }
}

/// Compact view of a run for history listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub plan_execution_id: Uuid,
    pub plan_id: String,
    pub plan_name: String,
    pub status: Status,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failure_message: Option<String>,
}

impl From<&RunRecord> for RunSummary {
    fn from(run: &RunRecord) -> Self {
        Self {
            plan_execution_id: run.plan_execution_id,
            plan_id: run.plan.id.clone(),
            plan_name: run.plan.name.clone(),
            status: run.status,
            started_at: run.started_at,
            ended_at: run.ended_at,
            failure_message: run.failure_info.as_ref().map(|f| f.message.clone()),
        }
    }
}
