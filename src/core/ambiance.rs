//! Ambiance: the immutable addressing context of a node execution
//!
//! An ambiance is the chain of [`Level`]s from the plan root down to the node,
//! together with the run's setup abstractions. Descending into a child always
//! produces a new ambiance; an existing one is never changed in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const ACCOUNT_ID: &str = "accountId";
pub const ORG_IDENTIFIER: &str = "orgIdentifier";
pub const PROJECT_IDENTIFIER: &str = "projectIdentifier";

/// Structural kind of a plan node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    Pipeline,
    Stage,
    StepGroup,
    Step,
    Strategy,
    Section,
    Fork,
}

impl NodeKind {
    /// Kinds that only group other nodes and do not appear in qualified names
    pub fn is_structural(self) -> bool {
        matches!(self, NodeKind::Strategy | NodeKind::Section | NodeKind::Fork)
    }
}

/// Position of an iteration inside a strategy (loop or matrix)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyMetadata {
    pub iteration: u32,
    pub total: u32,
}

/// One entry of the ambiance chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    /// Plan node id
    pub setup_id: String,

    /// Node execution id
    pub runtime_id: Uuid,

    pub identifier: String,

    #[serde(default)]
    pub step_type: String,

    pub kind: NodeKind,

    /// Zero for the first attempt, incremented on every retry
    #[serde(default)]
    pub retry_index: u32,

    #[serde(default)]
    pub strategy: Option<StrategyMetadata>,

    pub start_ts: DateTime<Utc>,
}

impl Level {
    pub fn new(
        setup_id: impl Into<String>,
        runtime_id: Uuid,
        identifier: impl Into<String>,
        kind: NodeKind,
    ) -> Self {
        Self {
            setup_id: setup_id.into(),
            runtime_id,
            identifier: identifier.into(),
            step_type: String::new(),
            kind,
            retry_index: 0,
            strategy: None,
            start_ts: Utc::now(),
        }
    }

    pub fn with_step_type(mut self, step_type: impl Into<String>) -> Self {
        self.step_type = step_type.into();
        self
    }

    pub fn with_retry_index(mut self, retry_index: u32) -> Self {
        self.retry_index = retry_index;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyMetadata) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// Addressing context of a node execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ambiance {
    pub plan_execution_id: Uuid,

    pub plan_id: String,

    /// Account / org / project identifiers, fixed for the whole run
    #[serde(default)]
    pub setup_abstractions: BTreeMap<String, String>,

    #[serde(default)]
    levels: Vec<Level>,
}

impl Ambiance {
    /// Root ambiance of a run, with no levels yet
    pub fn new(
        plan_execution_id: Uuid,
        plan_id: impl Into<String>,
        setup_abstractions: BTreeMap<String, String>,
    ) -> Self {
        Self {
            plan_execution_id,
            plan_id: plan_id.into(),
            setup_abstractions,
            levels: Vec::new(),
        }
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// New ambiance for a child: the current levels plus one
    pub fn derive(&self, level: Level) -> Ambiance {
        let mut child = self.clone();
        child.levels.push(level);
        child
    }

    /// Ambiance of the parent, i.e. without the last level
    pub fn clone_for_finish(&self) -> Ambiance {
        self.truncated(self.levels.len().saturating_sub(1))
    }

    /// Keep only the first `depth` levels
    pub fn truncated(&self, depth: usize) -> Ambiance {
        let mut copy = self.clone();
        copy.levels.truncate(depth);
        copy
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    pub fn current_runtime_id(&self) -> Option<Uuid> {
        self.current_level().map(|l| l.runtime_id)
    }

    pub fn current_setup_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.setup_id.as_str())
    }

    pub fn current_step_type(&self) -> Option<&str> {
        self.current_level().map(|l| l.step_type.as_str())
    }

    pub fn parent_runtime_id(&self) -> Option<Uuid> {
        let len = self.levels.len();
        if len < 2 {
            return None;
        }
        Some(self.levels[len - 2].runtime_id)
    }

    pub fn setup(&self, key: &str) -> Option<&str> {
        self.setup_abstractions.get(key).map(String::as_str)
    }

    pub fn account_id(&self) -> Option<&str> {
        self.setup(ACCOUNT_ID)
    }

    pub fn org_identifier(&self) -> Option<&str> {
        self.setup(ORG_IDENTIFIER)
    }

    pub fn project_identifier(&self) -> Option<&str> {
        self.setup(PROJECT_IDENTIFIER)
    }

    /// True when the current node is a retry attempt
    pub fn is_retry(&self) -> bool {
        self.current_level().is_some_and(|l| l.retry_index > 0)
    }

    /// Whether a node execution id appears anywhere in the chain
    pub fn contains_runtime_id(&self, runtime_id: Uuid) -> bool {
        self.levels.iter().any(|l| l.runtime_id == runtime_id)
    }

    fn last_of_kind(&self, kind: NodeKind) -> Option<&Level> {
        self.levels.iter().rev().find(|l| l.kind == kind)
    }

    pub fn stage_level(&self) -> Option<&Level> {
        self.last_of_kind(NodeKind::Stage)
    }

    pub fn step_group_level(&self) -> Option<&Level> {
        self.last_of_kind(NodeKind::StepGroup)
    }

    pub fn strategy_level(&self) -> Option<&Level> {
        self.last_of_kind(NodeKind::Strategy)
    }

    /// Level of the innermost strategy iteration, if any
    pub fn iteration_level(&self) -> Option<&Level> {
        self.levels.iter().rev().find(|l| l.strategy.is_some())
    }

    /// Suffix that tells strategy iterations apart, e.g. `_0_2`
    pub fn strategy_postfix(&self) -> String {
        self.levels
            .iter()
            .filter_map(|l| l.strategy)
            .map(|s| format!("_{}", s.iteration))
            .collect()
    }

    /// Fully qualified name built from the non-structural level identifiers
    pub fn fqn(&self) -> String {
        self.levels
            .iter()
            .filter(|l| !l.kind.is_structural())
            .map(|l| match l.strategy {
                Some(s) => format!("{}_{}", l.identifier, s.iteration),
                None => l.identifier.clone(),
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Number of leading levels shared with another ambiance
    pub fn shared_prefix_len(&self, other: &Ambiance) -> usize {
        self.levels
            .iter()
            .zip(other.levels.iter())
            .take_while(|(a, b)| a.runtime_id == b.runtime_id)
            .count()
    }
}
