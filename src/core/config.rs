//! Plan documents: compiled plans in YAML or JSON form

use crate::advise::{AdviserObtainment, AdviserType};
use crate::core::ambiance::NodeKind;
use crate::core::plan::{FacilitatorType, Plan, PlanNode, StrategySpec};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// Top-level plan document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    pub id: String,

    pub name: String,

    /// Id of the root node
    pub root: String,

    /// Setup abstractions (account, org, project, ...)
    #[serde(default)]
    pub setup: BTreeMap<String, String>,

    pub nodes: Vec<NodeConfig>,
}

/// Node as written in a plan document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,

    /// Defaults to the id
    #[serde(default)]
    pub identifier: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    pub kind: NodeKind,

    #[serde(default)]
    pub step_type: Option<String>,

    #[serde(default = "default_facilitator")]
    pub facilitator: FacilitatorType,

    #[serde(default)]
    pub parameters: Option<Value>,

    #[serde(default)]
    pub children: Vec<String>,

    #[serde(default)]
    pub strategy: Option<StrategySpec>,

    /// Advisers in priority order
    #[serde(default)]
    pub advisers: Vec<AdviserConfig>,

    /// Barrier this step waits on
    #[serde(default)]
    pub barrier: Option<String>,

    #[serde(default)]
    pub skip_unresolved_expressions: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdviserConfig {
    #[serde(rename = "type")]
    pub adviser_type: AdviserType,

    #[serde(default)]
    pub parameters: Option<Value>,
}

fn default_facilitator() -> FacilitatorType {
    FacilitatorType::Sync
}

impl PlanConfig {
    /// Load a plan document from a YAML (or JSON) file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse a plan document; JSON is accepted as well since it is valid YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PlanConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the plan document.
    ///
    /// Duplicate ids are a document problem; everything else is checked on
    /// the compiled plan, the same way the engine checks a plan before it runs.
    pub fn validate(&self) -> Result<()> {
        let mut seen_ids = HashSet::new();
        for node in &self.nodes {
            if !seen_ids.insert(node.id.as_str()) {
                anyhow::bail!("Duplicate node ID: {}", node.id);
            }
        }

        let plan = self.to_plan()?;
        plan.validate()
            .with_context(|| format!("Plan '{}' is invalid", self.id))?;
        Ok(())
    }

    /// Compile the document into the plan model.
    ///
    /// Children of a CHILD_CHAIN container are wired to their next sibling:
    /// success, ignore and mark-success decisions continue with it unless the
    /// document routes somewhere else.
    pub fn to_plan(&self) -> Result<Plan> {
        let mut chain_next: HashMap<&str, &str> = HashMap::new();
        for node in &self.nodes {
            if node.facilitator == FacilitatorType::ChildChain {
                for pair in node.children.windows(2) {
                    chain_next.insert(pair[0].as_str(), pair[1].as_str());
                }
            }
        }

        let mut plan = Plan::new(&self.id, &self.name, &self.root);
        plan.setup_abstractions = self.setup.clone();

        for node in &self.nodes {
            let mut advisers = node.advisers.clone();
            if let Some(next) = chain_next.get(node.id.as_str()) {
                wire_chain(&mut advisers, next);
            }

            let obtainments = advisers
                .iter()
                .map(AdviserConfig::to_obtainment)
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("Failed to encode advisers of node '{}'", node.id))?;

            let step_parameters = match &node.parameters {
                Some(value) => serde_json::to_value(value)
                    .with_context(|| format!("Node '{}' parameters are not JSON", node.id))?,
                None => serde_json::Value::Null,
            };

            let step_type = match (&node.step_type, &node.barrier) {
                (Some(step_type), _) => step_type.clone(),
                (None, Some(_)) => "Barrier".to_string(),
                (None, None) => String::new(),
            };

            plan = plan.with_node(PlanNode {
                id: node.id.clone(),
                identifier: node.identifier.clone().unwrap_or_else(|| node.id.clone()),
                name: node.name.clone().unwrap_or_else(|| node.id.clone()),
                kind: node.kind,
                step_type,
                step_parameters,
                facilitator: node.facilitator,
                children: node.children.clone(),
                strategy: node.strategy.clone(),
                advisers: obtainments,
                barrier_ref: node.barrier.clone(),
                skip_unresolved_expressions: node.skip_unresolved_expressions,
            });
        }

        Ok(plan)
    }
}

impl AdviserConfig {
    pub fn to_obtainment(&self) -> Result<AdviserObtainment> {
        let parameters = match &self.parameters {
            Some(value) => serde_json::to_vec(value)?,
            None => Vec::new(),
        };
        Ok(AdviserObtainment {
            adviser_type: self.adviser_type,
            parameters,
        })
    }

    fn next_node_id(&self) -> Option<&str> {
        self.parameters
            .as_ref()?
            .get("next_node_id")?
            .as_str()
    }

    fn set_next_node_id(&mut self, next: &str) {
        let mut mapping = match self.parameters.take() {
            Some(Value::Mapping(mapping)) => mapping,
            _ => serde_yaml::Mapping::new(),
        };
        mapping.insert(
            Value::String("next_node_id".to_string()),
            Value::String(next.to_string()),
        );
        self.parameters = Some(Value::Mapping(mapping));
    }
}

fn wire_chain(advisers: &mut Vec<AdviserConfig>, next: &str) {
    let mut has_on_success = false;
    for adviser in advisers.iter_mut() {
        match adviser.adviser_type {
            AdviserType::OnSuccess => {
                has_on_success = true;
                if adviser.next_node_id().is_none() {
                    adviser.set_next_node_id(next);
                }
            }
            AdviserType::Ignore | AdviserType::MarkSuccess => {
                if adviser.next_node_id().is_none() {
                    adviser.set_next_node_id(next);
                }
            }
            _ => {}
        }
    }
    if !has_on_success {
        let mut on_success = AdviserConfig {
            adviser_type: AdviserType::OnSuccess,
            parameters: None,
        };
        on_success.set_next_node_id(next);
        advisers.push(on_success);
    }
}
