//! Node start and facilitation
//!
//! Starting a node checks pause scopes, validates its advisers and resolves
//! the expressions in its parameters. Facilitation then decides how the node
//! runs: leaf steps call their executor (or rendezvous at a barrier) and
//! containers queue their children.

use crate::advise::AdviserChain;
use crate::core::{
    ExpressionEvaluator, FacilitatorType, FailureInfo, FailureType, NodeExecution, PlanNode,
    ResolveMode, Status, StepOutcome, StrategyMetadata,
};
use crate::execution::barrier::DropOutcome;
use crate::execution::engine::{derive_id, Engine};
use crate::execution::error::EngineError;
use crate::execution::events::{AdviseEvent, FacilitatorEvent, NodeStartEvent, SdkResponseEvent};
use crate::execution::executor::{StepContext, StepError, StepResponse};
use chrono::Utc;
use serde_json::Map;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl Engine {
    pub(crate) async fn handle_node_start(&self, event: NodeStartEvent) -> Result<(), EngineError> {
        let node = self.load_node(event.node_execution_id).await?;
        if node.status != Status::Queued {
            debug!("Node {} already started ({})", node.id, node.status);
            return Ok(());
        }

        let run = self.load_run(node.plan_execution_id).await?;
        if run.is_finished() {
            debug!("Run {} finished, not starting node {}", run.plan_execution_id, node.id);
            return Ok(());
        }
        if run.is_paused_for(node.ambiance.levels().iter().map(|l| l.runtime_id)) {
            self.transition_node(node.id, Status::Paused, |_| {}).await?;
            return Ok(());
        }

        let (_, plan_node) = self.plan_node(&node).await?;

        if let Err(e) = AdviserChain::build(&plan_node.advisers) {
            warn!("Node {} has invalid advisers: {}", node.id, e);
            let failed = self
                .transition_node(node.id, Status::Errored, |n| {
                    n.failure_info = Some(FailureInfo::internal(e.to_string()).with_origin(n.id));
                    n.ended_at = Some(Utc::now());
                })
                .await?;
            if let Some(failed) = failed {
                self.finish_node(&failed).await?;
            }
            return Ok(());
        }

        let mode = if plan_node.skip_unresolved_expressions {
            ResolveMode::ReturnOriginalIfUnresolved
        } else {
            ResolveMode::Strict
        };
        let snapshot = self.store().list_nodes(node.plan_execution_id).await?;
        let resolved = ExpressionEvaluator::new(&node.ambiance, &snapshot)
            .resolve_value(&node.step_parameters, mode);

        let resolved = match resolved {
            Ok(value) => value,
            Err(e) => {
                warn!("Node {} could not resolve its parameters: {}", node.id, e);
                let failed = self
                    .transition_node(node.id, Status::Errored, |n| {
                        n.failure_info =
                            Some(FailureInfo::internal(e.to_string()).with_origin(n.id));
                        n.ended_at = Some(Utc::now());
                    })
                    .await?;
                if let Some(failed) = failed {
                    self.publish_advise(&failed, Status::Queued).await?;
                }
                return Ok(());
            }
        };

        let started = self
            .transition_node(node.id, Status::Running, |n| {
                n.started_at = Some(Utc::now());
                n.resolved_parameters = Some(resolved.clone());
            })
            .await?;
        let Some(started) = started else {
            return Ok(());
        };

        let facilitate = FacilitatorEvent {
            node_execution_id: started.id,
            ambiance: started.ambiance.clone(),
            facilitator: plan_node.facilitator,
            step_type: plan_node.step_type.clone(),
            step_parameters: resolved,
            notify_id: format!("facilitate-{}", started.id),
            ref_objects: plan_node.children.clone(),
        };
        self.publish(&facilitate, Some(facilitate.notify_id.clone()), Duration::ZERO)
            .await?;
        Ok(())
    }

    pub(crate) async fn handle_facilitate(
        &self,
        event: FacilitatorEvent,
        attempt: u32,
    ) -> Result<(), EngineError> {
        let node = self.load_node(event.node_execution_id).await?;
        if !node.status.is_executing() && node.status != Status::Pausing {
            debug!("Node {} is {}, nothing to facilitate", node.id, node.status);
            return Ok(());
        }
        let (_, plan_node) = self.plan_node(&node).await?;

        match event.facilitator {
            FacilitatorType::Sync | FacilitatorType::Task | FacilitatorType::Async => {
                match &plan_node.barrier_ref {
                    Some(identifier) => self.arrive_at_barrier(&node, identifier).await,
                    None => self.execute_step(&node, &event, attempt).await,
                }
            }
            FacilitatorType::ChildChain => {
                match plan_node.children.first() {
                    Some(first) => {
                        self.queue_child(&node, first, None).await?;
                    }
                    None => self.respond(&node, StepOutcome::succeeded(Map::new())).await?,
                }
                Ok(())
            }
            FacilitatorType::Children => {
                if plan_node.children.is_empty() {
                    return self.respond(&node, StepOutcome::succeeded(Map::new())).await;
                }
                for child in &plan_node.children {
                    self.queue_child(&node, child, None).await?;
                }
                Ok(())
            }
            FacilitatorType::Strategy => self.expand_strategy(&node, &plan_node).await,
        }
    }

    async fn execute_step(
        &self,
        node: &NodeExecution,
        event: &FacilitatorEvent,
        attempt: u32,
    ) -> Result<(), EngineError> {
        let Some(executor) = self.executors().get(&event.step_type) else {
            warn!("No executor registered for step type '{}'", event.step_type);
            let failure = FailureInfo::internal(format!(
                "no executor registered for step type '{}'",
                event.step_type
            ));
            return self
                .respond(node, StepOutcome::with_status(Status::Errored, failure))
                .await;
        };

        let ctx = StepContext {
            node_execution_id: node.id,
            ambiance: node.ambiance.clone(),
            parameters: event.step_parameters.clone(),
            attempt,
        };

        let result = match self.config().step_timeout {
            Some(limit) => match tokio::time::timeout(limit, executor.execute(&ctx)).await {
                Ok(result) => result,
                Err(_) => {
                    let failure = FailureInfo::new(
                        format!("step timed out after {:?}", limit),
                        vec![FailureType::Timeout],
                    );
                    return self
                        .respond(node, StepOutcome::with_status(Status::Expired, failure))
                        .await;
                }
            },
            None => executor.execute(&ctx).await,
        };

        match result {
            Ok(StepResponse::Completed(outcome)) => self.respond(node, outcome).await,
            Ok(StepResponse::Delegated { task_id }) => {
                info!("Node {} delegated as task {}", node.id, task_id);
                self.modify_node(node.id, |n| {
                    if n.delegated_task_id.as_deref() == Some(task_id.as_str()) {
                        return Ok(false);
                    }
                    n.delegated_task_id = Some(task_id.clone());
                    Ok(true)
                })
                .await?;
                Ok(())
            }
            Ok(StepResponse::Waiting) => {
                debug!("Node {} waits for a callback", node.id);
                Ok(())
            }
            Err(StepError::Failed(failure)) => self.respond(node, StepOutcome::failed(failure)).await,
            Err(StepError::Transient(reason)) if attempt < self.config().max_deliveries => {
                Err(EngineError::StepUnavailable(reason))
            }
            Err(StepError::Transient(reason)) => {
                let failure = FailureInfo::new(reason, vec![FailureType::Connectivity]);
                self.respond(node, StepOutcome::with_status(Status::Errored, failure))
                    .await
            }
        }
    }

    async fn arrive_at_barrier(&self, node: &NodeExecution, identifier: &str) -> Result<(), EngineError> {
        match self
            .barriers()
            .drop(node.plan_execution_id, identifier, node)
            .await?
        {
            DropOutcome::Waiting { outstanding } => {
                debug!(
                    "Node {} waits at barrier {} ({} outstanding)",
                    node.id, identifier, outstanding
                );
                Ok(())
            }
            DropOutcome::Released(barrier) => self.release_barrier(&barrier).await,
            DropOutcome::AlreadyReleased(barrier) => {
                // A redelivered release may not have reached every branch
                self.release_barrier(&barrier).await?;
                self.respond(node, StepOutcome::succeeded(Map::new())).await
            }
            DropOutcome::NotParticipating => {
                let failure = FailureInfo::internal(format!(
                    "node {} has no position at barrier '{}'",
                    node.plan_node_id, identifier
                ));
                self.respond(node, StepOutcome::with_status(Status::Errored, failure))
                    .await
            }
        }
    }

    async fn expand_strategy(&self, node: &NodeExecution, plan_node: &PlanNode) -> Result<(), EngineError> {
        let iterations = plan_node.strategy.as_ref().map_or(0, |s| s.iterations);
        let Some(child_id) = plan_node.children.first() else {
            return Err(EngineError::Plan(format!(
                "strategy node '{}' has no child",
                plan_node.id
            )));
        };
        if iterations == 0 {
            return self.respond(node, StepOutcome::succeeded(Map::new())).await;
        }

        let iteration_ids: Vec<_> = (0..iterations)
            .map(|i| derive_id(node.id, &format!("iteration/{}", i)))
            .collect();
        self.barriers()
            .expand_strategy(node.plan_execution_id, &plan_node.id, node.id, &iteration_ids)
            .await?;

        for i in 0..iterations {
            let metadata = StrategyMetadata {
                iteration: i,
                total: iterations,
            };
            self.queue_child(node, child_id, Some((iteration_ids[i as usize], metadata)))
                .await?;
        }
        Ok(())
    }

    /// Queue one child of a container; strategy iterations bring their own id
    async fn queue_child(
        &self,
        parent: &NodeExecution,
        child_setup_id: &str,
        iteration: Option<(Uuid, StrategyMetadata)>,
    ) -> Result<(), EngineError> {
        let plan = self.plan_for(parent.plan_execution_id).await?;
        let child = plan
            .node(child_setup_id)
            .ok_or_else(|| EngineError::Plan(format!("plan node '{}' not found", child_setup_id)))?;

        let (id, strategy) = match iteration {
            Some((id, metadata)) => (id, Some(metadata)),
            None => (derive_id(parent.id, &format!("child/{}", child_setup_id)), None),
        };
        self.queue_node(&parent.ambiance, child, id, None, Vec::new(), 0, strategy)
            .await?;
        Ok(())
    }

    /// Feed a step outcome back through the response topic
    pub(crate) async fn respond(&self, node: &NodeExecution, outcome: StepOutcome) -> Result<(), EngineError> {
        let event = SdkResponseEvent::StepResponse {
            node_execution_id: node.id,
            outcome,
        };
        self.publish(&event, Some(format!("response-{}", node.id)), Duration::ZERO)
            .await?;
        Ok(())
    }

    pub(crate) async fn publish_advise(&self, node: &NodeExecution, from_status: Status) -> Result<(), EngineError> {
        let event = AdviseEvent {
            node_execution_id: node.id,
            from_status,
            to_status: node.status,
            failure_info: node.failure_info.clone(),
            retry_ids: node.retry_ids.clone(),
            previous_adviser_expired: false,
            manual: None,
        };
        self.publish(&event, Some(format!("advise-{}", node.id)), Duration::ZERO)
            .await?;
        Ok(())
    }
}
