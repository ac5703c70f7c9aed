//! Expression evaluation against a run snapshot
//!
//! Placeholders have the form `<+path>`:
//!
//! - `<+setup.KEY>`: a setup abstraction of the run
//! - `<+execution.id>`, `<+execution.planId>`: run identity
//! - `<+output.KEY[.path]>`: output `KEY` of the nearest enclosing node that
//!   produced it, searching from the current level up to the root
//! - `<+node.IDENTIFIER.outputs.KEY[.path]>`: output of the node with that
//!   identifier that is closest in the tree to the current node
//!
//! Evaluation is a pure function of the ambiance and the node executions it is
//! given; it never reads the store.

use crate::core::ambiance::Ambiance;
use crate::core::node_execution::NodeExecution;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolveMode {
    /// Unresolved expressions are an error
    #[default]
    Strict,
    /// Unresolved expressions are left as written
    ReturnOriginalIfUnresolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("unresolved expression <+{expression}>: {reason}")]
    Unresolved { expression: String, reason: String },

    #[error("invalid expression syntax: {0}")]
    Invalid(String),
}

impl ResolutionError {
    fn unresolved(expression: &str, reason: impl Into<String>) -> Self {
        ResolutionError::Unresolved {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}

fn placeholder() -> Result<&'static Regex, ResolutionError> {
    static PATTERN: OnceLock<Result<Regex, String>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"<\+([^<>]+)>").map_err(|e| e.to_string()))
        .as_ref()
        .map_err(|e| ResolutionError::Invalid(e.clone()))
}

/// Evaluator bound to one node's ambiance and a snapshot of its run
pub struct ExpressionEvaluator<'a> {
    ambiance: &'a Ambiance,
    nodes: &'a [NodeExecution],
}

impl<'a> ExpressionEvaluator<'a> {
    pub fn new(ambiance: &'a Ambiance, nodes: &'a [NodeExecution]) -> Self {
        Self { ambiance, nodes }
    }

    /// Resolve a single expression body (without the `<+ >` delimiters)
    pub fn resolve_expression(&self, expression: &str) -> Result<Value, ResolutionError> {
        let expression = expression.trim();
        let mut parts = expression.split('.');
        let root = parts.next().unwrap_or_default();
        let rest: Vec<&str> = parts.collect();

        match root {
            "setup" => {
                let key = rest.join(".");
                self.ambiance
                    .setup(&key)
                    .map(|v| Value::String(v.to_string()))
                    .ok_or_else(|| ResolutionError::unresolved(expression, "unknown setup key"))
            }
            "execution" => match rest.as_slice() {
                ["id"] => Ok(Value::String(self.ambiance.plan_execution_id.to_string())),
                ["planId"] => Ok(Value::String(self.ambiance.plan_id.clone())),
                _ => Err(ResolutionError::unresolved(expression, "unknown execution field")),
            },
            "strategy" => {
                let strategy = self
                    .ambiance
                    .iteration_level()
                    .and_then(|l| l.strategy)
                    .ok_or_else(|| ResolutionError::unresolved(expression, "not inside a strategy"))?;
                match rest.as_slice() {
                    ["iteration"] => Ok(Value::from(strategy.iteration)),
                    ["iterations"] => Ok(Value::from(strategy.total)),
                    _ => Err(ResolutionError::unresolved(expression, "unknown strategy field")),
                }
            }
            "output" => {
                let (key, path) = rest
                    .split_first()
                    .ok_or_else(|| ResolutionError::Invalid(expression.to_string()))?;
                self.output_in_scope(key)
                    .and_then(|v| walk(v, path))
                    .cloned()
                    .ok_or_else(|| {
                        ResolutionError::unresolved(expression, "no enclosing node produced it")
                    })
            }
            "node" => match rest.as_slice() {
                [identifier, "outputs", key, path @ ..] => self
                    .nearest_node(identifier)
                    .and_then(|n| n.outputs.get(*key))
                    .and_then(|v| walk(v, path))
                    .cloned()
                    .ok_or_else(|| ResolutionError::unresolved(expression, "output not found")),
                _ => Err(ResolutionError::Invalid(expression.to_string())),
            },
            _ => Err(ResolutionError::unresolved(expression, "unknown root")),
        }
    }

    /// Resolve every placeholder inside a JSON value
    pub fn resolve_value(&self, value: &Value, mode: ResolveMode) -> Result<Value, ResolutionError> {
        match value {
            Value::String(s) => self.resolve_str(s, mode),
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve_value(v, mode))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut resolved = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    resolved.insert(k.clone(), self.resolve_value(v, mode)?);
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve_str(&self, text: &str, mode: ResolveMode) -> Result<Value, ResolutionError> {
        let pattern = placeholder()?;

        // A string that is exactly one placeholder keeps the JSON type
        if let Some(caps) = pattern.captures(text) {
            if caps.get(0).map(|m| m.as_str()) == Some(text) {
                return match self.resolve_expression(&caps[1]) {
                    Ok(value) => Ok(value),
                    Err(_) if mode == ResolveMode::ReturnOriginalIfUnresolved => {
                        Ok(Value::String(text.to_string()))
                    }
                    Err(e) => Err(e),
                };
            }
        }

        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in pattern.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&text[last..whole.start()]);
            match self.resolve_expression(&caps[1]) {
                Ok(Value::String(s)) => out.push_str(&s),
                Ok(other) => out.push_str(&other.to_string()),
                Err(_) if mode == ResolveMode::ReturnOriginalIfUnresolved => {
                    out.push_str(whole.as_str())
                }
                Err(e) => return Err(e),
            }
            last = whole.end();
        }
        out.push_str(&text[last..]);
        Ok(Value::String(out))
    }

    fn node(&self, id: uuid::Uuid) -> Option<&'a NodeExecution> {
        self.nodes.iter().find(|n| n.id == id)
    }

    fn output_in_scope(&self, key: &str) -> Option<&'a Value> {
        self.ambiance
            .levels()
            .iter()
            .rev()
            .filter_map(|level| self.node(level.runtime_id))
            .find_map(|node| node.outputs.get(key))
    }

    fn nearest_node(&self, identifier: &str) -> Option<&'a NodeExecution> {
        self.nodes
            .iter()
            .filter(|n| n.identifier == identifier && !n.old_retry)
            .max_by(|a, b| {
                let da = self.ambiance.shared_prefix_len(&a.ambiance);
                let db = self.ambiance.shared_prefix_len(&b.ambiance);
                da.cmp(&db).then(a.created_at.cmp(&b.created_at))
            })
    }
}

fn walk<'v>(value: &'v Value, path: &[&str]) -> Option<&'v Value> {
    path.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(*segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Convenience wrapper for a single expression
pub fn resolve(
    ambiance: &Ambiance,
    nodes: &[NodeExecution],
    expression: &str,
) -> Result<Value, ResolutionError> {
    ExpressionEvaluator::new(ambiance, nodes).resolve_expression(expression)
}
