//! Barrier documents
//!
//! A barrier is created per run from the plan's setup info. Each position is
//! one branch that must arrive before any waiting branch continues. Positions
//! declared inside a strategy start as templates and are replaced by one
//! concrete position per iteration when that strategy starts. A retried
//! strategy expands again and takes over the positions its previous
//! execution left open.

use crate::core::ambiance::Ambiance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BarrierState {
    Standing,
    Down,
}

/// Static description of a position, derived from the plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierPositionSetup {
    pub stage_setup_id: Option<String>,
    pub step_group_setup_id: Option<String>,
    pub step_setup_id: String,
    /// Enclosing strategy node, if any
    pub strategy_setup_id: Option<String>,
}

/// Barrier identifier plus the positions that take part in it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierSetupInfo {
    pub identifier: String,
    pub positions: Vec<BarrierPositionSetup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarrierPosition {
    pub setup: BarrierPositionSetup,

    /// Strategy execution and iteration this position was expanded for
    #[serde(default)]
    pub strategy_runtime_id: Option<Uuid>,
    #[serde(default)]
    pub iteration_runtime_id: Option<Uuid>,

    #[serde(default)]
    pub stage_runtime_id: Option<Uuid>,
    #[serde(default)]
    pub step_group_runtime_id: Option<Uuid>,
    /// Set once the branch arrives
    #[serde(default)]
    pub step_runtime_id: Option<Uuid>,
}

impl BarrierPosition {
    fn from_setup(setup: BarrierPositionSetup) -> Self {
        Self {
            setup,
            strategy_runtime_id: None,
            iteration_runtime_id: None,
            stage_runtime_id: None,
            step_group_runtime_id: None,
            step_runtime_id: None,
        }
    }

    /// Inside a strategy that has not been expanded yet
    pub fn is_template(&self) -> bool {
        self.setup.strategy_setup_id.is_some() && self.iteration_runtime_id.is_none()
    }

    pub fn has_arrived(&self) -> bool {
        self.step_runtime_id.is_some()
    }

    fn belongs_to(&self, strategy_setup_id: &str) -> bool {
        self.setup.strategy_setup_id.as_deref() == Some(strategy_setup_id)
    }

    fn accepts(&self, step_setup_id: &str, ambiance: &Ambiance) -> bool {
        if self.is_template() || self.setup.step_setup_id != step_setup_id {
            return false;
        }
        match self.iteration_runtime_id {
            Some(iteration) => ambiance.contains_runtime_id(iteration),
            None => true,
        }
    }
}

/// Result of recording an arrival on the document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// First arrival of this branch
    Recorded,
    /// The branch had already arrived
    Duplicate,
    /// No position matches the node
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarrierInstance {
    pub id: Uuid,
    pub identifier: String,
    pub plan_execution_id: Uuid,
    pub state: BarrierState,
    pub positions: Vec<BarrierPosition>,
    /// Setup of every position declared inside a strategy
    #[serde(default)]
    pub templates: Vec<BarrierPositionSetup>,
    /// Strategy node executions whose template positions were expanded
    #[serde(default)]
    pub expanded_strategies: BTreeSet<Uuid>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl BarrierInstance {
    pub fn new(plan_execution_id: Uuid, info: &BarrierSetupInfo) -> Self {
        Self {
            id: Uuid::new_v4(),
            identifier: info.identifier.clone(),
            plan_execution_id,
            state: BarrierState::Standing,
            positions: info
                .positions
                .iter()
                .cloned()
                .map(BarrierPosition::from_setup)
                .collect(),
            templates: info
                .positions
                .iter()
                .filter(|p| p.strategy_setup_id.is_some())
                .cloned()
                .collect(),
            expanded_strategies: BTreeSet::new(),
            version: 0,
            created_at: Utc::now(),
            released_at: None,
        }
    }

    pub fn is_down(&self) -> bool {
        self.state == BarrierState::Down
    }

    pub fn has_templates_for(&self, strategy_setup_id: &str) -> bool {
        self.templates
            .iter()
            .any(|t| t.strategy_setup_id.as_deref() == Some(strategy_setup_id))
    }

    /// Give a strategy execution one position per template and iteration.
    ///
    /// Open positions of the strategy, whether unexpanded templates or
    /// positions of an earlier execution that never arrived, are replaced.
    /// Arrived positions stay. Returns false when this strategy execution
    /// was already expanded.
    pub fn expand_strategy(
        &mut self,
        strategy_setup_id: &str,
        strategy_runtime_id: Uuid,
        iteration_runtime_ids: &[Uuid],
    ) -> bool {
        if !self.expanded_strategies.insert(strategy_runtime_id) {
            return false;
        }

        self.positions
            .retain(|p| !p.belongs_to(strategy_setup_id) || p.has_arrived());

        for template in &self.templates {
            if template.strategy_setup_id.as_deref() != Some(strategy_setup_id) {
                continue;
            }
            for iteration in iteration_runtime_ids {
                let mut position = BarrierPosition::from_setup(template.clone());
                position.strategy_runtime_id = Some(strategy_runtime_id);
                position.iteration_runtime_id = Some(*iteration);
                self.positions.push(position);
            }
        }
        true
    }

    /// Record that the step `step_setup_id` running under `ambiance` arrived
    pub fn arrive(&mut self, step_setup_id: &str, ambiance: &Ambiance) -> Arrival {
        let Some(position) = self
            .positions
            .iter_mut()
            .find(|p| p.accepts(step_setup_id, ambiance))
        else {
            return Arrival::Unknown;
        };

        if position.has_arrived() {
            return Arrival::Duplicate;
        }

        position.step_runtime_id = ambiance.current_runtime_id();
        position.stage_runtime_id = ambiance.stage_level().map(|l| l.runtime_id);
        position.step_group_runtime_id = ambiance.step_group_level().map(|l| l.runtime_id);
        Arrival::Recorded
    }

    /// Positions not yet arrived, templates included
    pub fn outstanding(&self) -> usize {
        self.positions.iter().filter(|p| !p.has_arrived()).count()
    }

    pub fn release(&mut self) {
        self.state = BarrierState::Down;
        self.released_at = Some(Utc::now());
    }

    /// Node executions that arrived and wait for the release
    pub fn waiting_nodes(&self) -> Vec<Uuid> {
        self.positions
            .iter()
            .filter_map(|p| p.step_runtime_id)
            .collect()
    }
}
