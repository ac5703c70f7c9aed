//! Compiled execution plan consumed by the engine

use crate::advise::{AdviserChain, AdviserError, AdviserObtainment, AdviserType};
use crate::core::ambiance::NodeKind;
use crate::core::barrier::{BarrierPositionSetup, BarrierSetupInfo};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

/// How a node gets executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FacilitatorType {
    /// Run the step executor inline
    Sync,
    /// Delegate to an external worker, completed by a task response
    Task,
    /// Park the node until a callback arrives
    Async,
    /// Run children one after another
    ChildChain,
    /// Run children in parallel
    Children,
    /// Run the single child once per iteration, in parallel
    Strategy,
}

impl FacilitatorType {
    pub fn is_container(self) -> bool {
        matches!(
            self,
            FacilitatorType::ChildChain | FacilitatorType::Children | FacilitatorType::Strategy
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategySpec {
    pub iterations: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: String,
    pub identifier: String,
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub step_type: String,
    #[serde(default)]
    pub step_parameters: Value,
    pub facilitator: FacilitatorType,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub strategy: Option<StrategySpec>,
    /// In priority order
    #[serde(default)]
    pub advisers: Vec<AdviserObtainment>,
    #[serde(default)]
    pub barrier_ref: Option<String>,
    /// Leave unresolved expressions in place instead of failing the node
    #[serde(default)]
    pub skip_unresolved_expressions: bool,
}

impl PlanNode {
    pub fn new(
        id: impl Into<String>,
        kind: NodeKind,
        facilitator: FacilitatorType,
    ) -> Self {
        let id = id.into();
        Self {
            identifier: id.clone(),
            name: id.clone(),
            id,
            kind,
            step_type: String::new(),
            step_parameters: Value::Null,
            facilitator,
            children: Vec::new(),
            strategy: None,
            advisers: Vec::new(),
            barrier_ref: None,
            skip_unresolved_expressions: false,
        }
    }

    pub fn with_step_type(mut self, step_type: impl Into<String>) -> Self {
        self.step_type = step_type.into();
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.step_parameters = parameters;
        self
    }

    pub fn with_children(mut self, children: &[&str]) -> Self {
        self.children = children.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_adviser(mut self, adviser: AdviserObtainment) -> Self {
        self.advisers.push(adviser);
        self
    }

    pub fn with_strategy(mut self, iterations: u32) -> Self {
        self.strategy = Some(StrategySpec { iterations });
        self
    }

    pub fn with_barrier(mut self, identifier: impl Into<String>) -> Self {
        self.barrier_ref = Some(identifier.into());
        self
    }
}

/// Structural problem in a plan; the plan cannot be run
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("root node '{0}' does not exist")]
    MissingRoot(String),

    #[error("node stored under '{key}' has id '{id}'")]
    MismatchedId { key: String, id: String },

    #[error("node '{node}' has non-existent child '{child}'")]
    MissingChild { node: String, child: String },

    #[error("node '{child}' is a child of both '{first}' and '{second}'")]
    SharedChild {
        child: String,
        first: String,
        second: String,
    },

    #[error("root node '{0}' cannot be a child")]
    RootIsChild(String),

    #[error("cycle detected in plan involving node '{0}'")]
    Cycle(String),

    #[error("node '{0}' is not reachable from the root")]
    Unreachable(String),

    #[error("node '{node}' with facilitator {facilitator:?} cannot have children")]
    LeafWithChildren {
        node: String,
        facilitator: FacilitatorType,
    },

    #[error("step node '{0}' has no step_type")]
    MissingStepType(String),

    #[error("strategy node '{0}' must have exactly one child")]
    StrategyChildren(String),

    #[error("strategy node '{0}' has no strategy settings")]
    MissingStrategy(String),

    #[error("node '{node}' has strategy settings but facilitator {facilitator:?}")]
    MisplacedStrategy {
        node: String,
        facilitator: FacilitatorType,
    },

    #[error("barrier step '{0}' must use the ASYNC facilitator")]
    BarrierNotAsync(String),

    #[error("node '{node}' has invalid advisers: {source}")]
    InvalidAdvisers {
        node: String,
        #[source]
        source: AdviserError,
    },

    #[error("node '{node}' adviser {adviser_type:?} routes to '{target}', which is not a sibling")]
    RouteNotSibling {
        node: String,
        adviser_type: AdviserType,
        target: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub root_node_id: String,
    pub nodes: BTreeMap<String, PlanNode>,
    #[serde(default)]
    pub setup_abstractions: BTreeMap<String, String>,
}

impl Plan {
    pub fn new(id: impl Into<String>, name: impl Into<String>, root_node_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            root_node_id: root_node_id.into(),
            nodes: BTreeMap::new(),
            setup_abstractions: BTreeMap::new(),
        }
    }

    pub fn with_node(mut self, node: PlanNode) -> Self {
        self.nodes.insert(node.id.clone(), node);
        self
    }

    pub fn with_setup(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.setup_abstractions.insert(key.into(), value.into());
        self
    }

    pub fn node(&self, id: &str) -> Option<&PlanNode> {
        self.nodes.get(id)
    }

    pub fn root(&self) -> Option<&PlanNode> {
        self.node(&self.root_node_id)
    }

    pub fn parent_of(&self, id: &str) -> Option<&PlanNode> {
        self.nodes
            .values()
            .find(|n| n.children.iter().any(|c| c == id))
    }

    /// Ancestors from the direct parent up to the root
    pub fn ancestors(&self, id: &str) -> Vec<&PlanNode> {
        let mut chain = Vec::new();
        let mut current = id;
        while let Some(parent) = self.parent_of(current) {
            if chain.iter().any(|n: &&PlanNode| n.id == parent.id) {
                break;
            }
            chain.push(parent);
            current = &parent.id;
        }
        chain
    }

    /// Check the container tree and every node's settings before a run starts
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.root().is_none() {
            return Err(PlanError::MissingRoot(self.root_node_id.clone()));
        }

        let mut parents: HashMap<&str, &str> = HashMap::new();
        for (key, node) in &self.nodes {
            if *key != node.id {
                return Err(PlanError::MismatchedId {
                    key: key.clone(),
                    id: node.id.clone(),
                });
            }
            for child in &node.children {
                if !self.nodes.contains_key(child) {
                    return Err(PlanError::MissingChild {
                        node: node.id.clone(),
                        child: child.clone(),
                    });
                }
                if let Some(first) = parents.insert(child.as_str(), node.id.as_str()) {
                    return Err(PlanError::SharedChild {
                        child: child.clone(),
                        first: first.to_string(),
                        second: node.id.clone(),
                    });
                }
            }
        }
        if parents.contains_key(self.root_node_id.as_str()) {
            return Err(PlanError::RootIsChild(self.root_node_id.clone()));
        }

        // With a single parent per node, walking up either reaches the root,
        // stops at an orphan or loops
        for id in self.nodes.keys() {
            let mut seen = HashSet::new();
            let mut current = id.as_str();
            while let Some(parent) = parents.get(current) {
                if !seen.insert(current) {
                    return Err(PlanError::Cycle(current.to_string()));
                }
                current = *parent;
            }
            if current != self.root_node_id {
                return Err(PlanError::Unreachable(id.clone()));
            }
        }

        for node in self.nodes.values() {
            self.validate_node(node, parents.get(node.id.as_str()).copied())?;
        }
        Ok(())
    }

    fn validate_node(&self, node: &PlanNode, parent: Option<&str>) -> Result<(), PlanError> {
        match node.facilitator {
            FacilitatorType::Sync | FacilitatorType::Task | FacilitatorType::Async => {
                if !node.children.is_empty() {
                    return Err(PlanError::LeafWithChildren {
                        node: node.id.clone(),
                        facilitator: node.facilitator,
                    });
                }
                if node.step_type.is_empty() && node.barrier_ref.is_none() {
                    return Err(PlanError::MissingStepType(node.id.clone()));
                }
            }
            FacilitatorType::Strategy => {
                if node.children.len() != 1 {
                    return Err(PlanError::StrategyChildren(node.id.clone()));
                }
                if node.strategy.is_none() {
                    return Err(PlanError::MissingStrategy(node.id.clone()));
                }
            }
            FacilitatorType::ChildChain | FacilitatorType::Children => {}
        }

        if node.strategy.is_some() && node.facilitator != FacilitatorType::Strategy {
            return Err(PlanError::MisplacedStrategy {
                node: node.id.clone(),
                facilitator: node.facilitator,
            });
        }
        if node.barrier_ref.is_some() && node.facilitator != FacilitatorType::Async {
            return Err(PlanError::BarrierNotAsync(node.id.clone()));
        }

        let chain = AdviserChain::build(&node.advisers).map_err(|source| PlanError::InvalidAdvisers {
            node: node.id.clone(),
            source,
        })?;
        for adviser in chain.advisers() {
            let Some(target) = adviser.next_node_id() else {
                continue;
            };
            let sibling = parent
                .and_then(|p| self.node(p))
                .is_some_and(|p| p.children.iter().any(|c| c == target));
            if !sibling || target == node.id {
                return Err(PlanError::RouteNotSibling {
                    node: node.id.clone(),
                    adviser_type: adviser.adviser_type(),
                    target: target.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Barrier identifiers and the nodes that take part in each
    pub fn barrier_setup_info(&self) -> Vec<BarrierSetupInfo> {
        let mut barriers: BTreeMap<&str, Vec<BarrierPositionSetup>> = BTreeMap::new();

        for node in self.nodes.values() {
            let Some(identifier) = node.barrier_ref.as_deref() else {
                continue;
            };
            let ancestors = self.ancestors(&node.id);
            let nearest = |kind: NodeKind| {
                ancestors
                    .iter()
                    .find(|a| a.kind == kind)
                    .map(|a| a.id.clone())
            };
            let strategy_setup_id = ancestors
                .iter()
                .find(|a| a.facilitator == FacilitatorType::Strategy)
                .map(|a| a.id.clone());

            barriers
                .entry(identifier)
                .or_default()
                .push(BarrierPositionSetup {
                    stage_setup_id: nearest(NodeKind::Stage),
                    step_group_setup_id: nearest(NodeKind::StepGroup),
                    step_setup_id: node.id.clone(),
                    strategy_setup_id,
                });
        }

        barriers
            .into_iter()
            .map(|(identifier, positions)| BarrierSetupInfo {
                identifier: identifier.to_string(),
                positions,
            })
            .collect()
    }
}
