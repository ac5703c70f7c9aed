//! Step responses, container completion and adviser decisions
//!
//! A finished node is advised exactly once: the decision is stored on the
//! node before it is applied, so a redelivered advise event replays the same
//! decision instead of asking the chain again.

use crate::advise::{
    AdviseType, AdviserChain, AdviserError, AdviserResponse, AdviserType, AdvisingEvent,
};
use crate::core::status::aggregate;
use crate::core::{FacilitatorType, FailureInfo, NodeExecution, PlanNode, Status, StepOutcome};
use crate::execution::engine::{derive_id, Engine};
use crate::execution::error::EngineError;
use crate::execution::events::{AdviseEvent, ExecutionEvent, SdkResponseEvent};
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl Engine {
    pub(crate) async fn handle_sdk_response(&self, event: SdkResponseEvent) -> Result<(), EngineError> {
        match event {
            SdkResponseEvent::StepResponse {
                node_execution_id,
                outcome,
            } => self.apply_step_response(node_execution_id, outcome).await,
            SdkResponseEvent::ChildEnded {
                parent_id,
                child_id,
            } => self.child_ended(parent_id, child_id).await,
        }
    }

    async fn apply_step_response(&self, id: Uuid, outcome: StepOutcome) -> Result<(), EngineError> {
        let node = self.load_node(id).await?;

        if node.status == Status::Pausing {
            // Safe point reached: keep the outcome until the node is resumed
            self.transition_node(id, Status::Paused, |n| {
                n.held_response = Some(outcome.clone());
            })
            .await?;
            return Ok(());
        }
        if !node.status.is_executing() {
            debug!("Response for node {} ignored, node is {}", id, node.status);
            return Ok(());
        }

        let from = node.status;
        let updated = self
            .modify_node(id, |n| {
                if !n.status.is_executing() {
                    return Ok(false);
                }
                if outcome.status.is_final() && n.status.can_transition_to(outcome.status) {
                    n.apply_outcome(&outcome);
                } else {
                    n.status = Status::Errored;
                    n.failure_info = Some(
                        FailureInfo::internal(format!(
                            "step reported non-final status {}",
                            outcome.status
                        ))
                        .with_origin(n.id),
                    );
                    n.ended_at = Some(Utc::now());
                }
                n.held_response = None;
                Ok(true)
            })
            .await?;

        if let Some(updated) = updated {
            self.publish_advise(&updated, from).await?;
        }
        Ok(())
    }

    async fn child_ended(&self, parent_id: Uuid, child_id: Uuid) -> Result<(), EngineError> {
        let parent = self.load_node(parent_id).await?;
        if !parent.status.is_executing() || parent.concluded {
            debug!(
                "Child {} ended under node {} which is {}",
                child_id, parent_id, parent.status
            );
            return Ok(());
        }

        let (_, plan_node) = self.plan_node(&parent).await?;
        let children = self.store().fetch_children(parent_id, false).await?;
        if children.len() < expected_children(&plan_node) || children.iter().any(|c| !c.concluded) {
            debug!("Node {} still has running children", parent_id);
            return Ok(());
        }

        let status = aggregate(children.iter().map(|c| (c.status, c.failure_ignored)));
        let failure = children
            .iter()
            .find(|c| c.status == status && c.status.is_failure() && !c.is_absorbed())
            .and_then(|c| c.failure_info.clone());

        let from = parent.status;
        let updated = self
            .modify_node(parent_id, |n| {
                if !n.status.is_executing() {
                    return Ok(false);
                }
                n.status = status;
                n.failure_info = failure.clone();
                n.ended_at = Some(Utc::now());
                Ok(true)
            })
            .await?;

        if let Some(updated) = updated {
            self.publish_advise(&updated, from).await?;
        }
        Ok(())
    }

    pub(crate) async fn handle_advise(&self, event: AdviseEvent) -> Result<(), EngineError> {
        let node = self.load_node(event.node_execution_id).await?;
        if node.old_retry || node.concluded {
            debug!("Node {} already handed over, advise skipped", node.id);
            return Ok(());
        }
        if node.status == Status::Aborted {
            // Aborted nodes are never advised
            return self.finish_node(&node).await;
        }
        if let Some(parent_id) = node.parent_id {
            if self.load_node(parent_id).await?.status == Status::Aborted {
                debug!("Parent of node {} was aborted", node.id);
                return self.conclude(node.id).await;
            }
        }
        if self.load_run(node.plan_execution_id).await?.is_finished() {
            debug!("Run of node {} finished, advise skipped", node.id);
            return Ok(());
        }

        let (_, plan_node) = self.plan_node(&node).await?;
        let chain = match AdviserChain::build(&plan_node.advisers) {
            Ok(chain) => chain,
            Err(e) => {
                warn!("Advisers of node {} unusable: {}", node.id, e);
                AdviserChain::default()
            }
        };

        if event.manual.is_some() || event.previous_adviser_expired {
            return self.resolve_intervention(node, &event, &chain).await;
        }
        if !node.status.is_final() {
            debug!("Node {} is {}, nothing to advise", node.id, node.status);
            return Ok(());
        }

        let (adviser, response) = match node.adviser_response.clone() {
            Some(stored) => (None, stored),
            None => {
                let advising = AdvisingEvent {
                    ambiance: node.ambiance.clone(),
                    from_status: event.from_status,
                    to_status: node.status,
                    failure_info: node.failure_info.clone(),
                    previous_adviser_expired: false,
                    retry_ids: node.retry_ids.clone(),
                };
                let Some((adviser, response)) = chain.advise(&advising) else {
                    debug!("No adviser for node {} ({})", node.id, node.status);
                    return self.finish_node(&node).await;
                };
                self.modify_node(node.id, |n| {
                    if n.adviser_response.is_some() {
                        return Ok(false);
                    }
                    n.adviser_response = Some(response.clone());
                    Ok(true)
                })
                .await?;
                (Some(adviser), response)
            }
        };

        self.apply_decision(node, adviser, response).await
    }

    /// Resolve an INPUT_WAITING node, either by an intervention interrupt or
    /// because the wait timed out
    async fn resolve_intervention(
        &self,
        node: NodeExecution,
        event: &AdviseEvent,
        chain: &AdviserChain,
    ) -> Result<(), EngineError> {
        if node.status != Status::InputWaiting {
            debug!("Node {} no longer waits for input", node.id);
            return Ok(());
        }
        let restored = node.status_before_wait.unwrap_or(Status::Failed);

        let (adviser, response) = match event.manual {
            Some(AdviseType::Retry) => (
                None,
                AdviserResponse::Retry {
                    wait_secs: 0,
                    retry_ids: node.retry_ids.clone(),
                },
            ),
            Some(AdviseType::MarkSuccess) => (
                None,
                AdviserResponse::MarkSuccess {
                    next_node_id: chain.success_next_node(),
                },
            ),
            Some(AdviseType::Ignore) => (
                None,
                AdviserResponse::Ignore {
                    next_node_id: chain.success_next_node(),
                },
            ),
            Some(other) => return Err(AdviserError::UnknownAdviseType(other).into()),
            None => {
                let advising = AdvisingEvent {
                    ambiance: node.ambiance.clone(),
                    from_status: Status::InputWaiting,
                    to_status: restored,
                    failure_info: node.failure_info.clone(),
                    previous_adviser_expired: true,
                    retry_ids: node.retry_ids.clone(),
                };
                match chain.advise(&advising) {
                    Some((adviser, response)) => (Some(adviser), response),
                    None => {
                        info!("Intervention wait of node {} expired", node.id);
                        let restored_node = self
                            .transition_node(node.id, restored, |n| n.adviser_response = None)
                            .await?;
                        if let Some(restored_node) = restored_node {
                            self.finish_node(&restored_node).await?;
                        }
                        return Ok(());
                    }
                }
            }
        };

        let restored_node = self
            .transition_node(node.id, restored, |n| {
                n.adviser_response = Some(response.clone());
            })
            .await?;
        let Some(restored_node) = restored_node else {
            return Ok(());
        };
        self.apply_decision(restored_node, adviser, response).await
    }

    async fn apply_decision(
        &self,
        node: NodeExecution,
        adviser: Option<AdviserType>,
        response: AdviserResponse,
    ) -> Result<(), EngineError> {
        let advise_type = response.advise_type();
        info!("Node {} advised {:?}", node.identifier, advise_type);
        self.emit(ExecutionEvent::AdviserDecision {
            node_execution_id: node.id,
            adviser,
            advise_type,
        });
        AdviseHandler::for_type(advise_type)?
            .handle(self, node, &response)
            .await
    }

    /// Continue with the sibling `next`, or hand the node to its parent
    async fn advance(&self, node: &NodeExecution, next: Option<&str>) -> Result<(), EngineError> {
        let target = match next {
            Some(target) if node.parent_id.is_some() => target,
            Some(target) => {
                warn!("Root node {} cannot continue with '{}'", node.id, target);
                return self.finish_node(node).await;
            }
            None => return self.finish_node(node).await,
        };

        let plan = self.plan_for(node.plan_execution_id).await?;
        let sibling = plan
            .node(target)
            .ok_or_else(|| EngineError::Plan(format!("next node '{}' not found", target)))?;
        let strategy = node.ambiance.current_level().and_then(|l| l.strategy);
        self.queue_node(
            &node.ambiance.clone_for_finish(),
            sibling,
            derive_id(node.id, &format!("next/{}", target)),
            Some(node.id),
            Vec::new(),
            0,
            strategy,
        )
        .await?;
        self.conclude(node.id).await
    }

    async fn conclude(&self, id: Uuid) -> Result<(), EngineError> {
        self.modify_node(id, |n| {
            if n.concluded {
                return Ok(false);
            }
            n.concluded = true;
            Ok(true)
        })
        .await?;
        Ok(())
    }

    /// Record a plan error on the node it surfaced for and hand the node on.
    ///
    /// A node that already finished cannot become ERRORED; the error then
    /// belongs to the container whose continuation is broken.
    pub(crate) async fn fail_on_plan_error(&self, id: Uuid, reason: &str) -> Result<(), EngineError> {
        let mut current = self.load_node(id).await?;
        loop {
            let failure =
                FailureInfo::internal(format!("plan error: {}", reason)).with_origin(current.id);

            if current.status.can_transition_to(Status::Errored) {
                let failed = self
                    .transition_node(current.id, Status::Errored, |n| {
                        n.failure_info = Some(failure.clone());
                        n.ended_at = Some(Utc::now());
                    })
                    .await?;
                if let Some(failed) = failed {
                    self.finish_node(&failed).await?;
                }
                return Ok(());
            }
            if !current.status.is_final() || current.concluded {
                debug!(
                    "Plan error for node {} not recorded, node is {}",
                    current.id, current.status
                );
                return Ok(());
            }

            self.conclude(current.id).await?;
            match current.parent_id {
                Some(parent_id) => current = self.load_node(parent_id).await?,
                None => {
                    return self
                        .complete_run(current.plan_execution_id, Status::Errored, Some(failure))
                        .await;
                }
            }
        }
    }

    /// Abort every other active node of the run and end it with `node`'s result
    async fn end_plan(&self, node: &NodeExecution) -> Result<(), EngineError> {
        for other in self.store().fetch_non_final(node.plan_execution_id).await? {
            if other.id == node.id || !other.status.can_transition_to(Status::Aborted) {
                continue;
            }
            match self
                .transition_node(other.id, Status::Aborted, |n| n.ended_at = Some(Utc::now()))
                .await
            {
                Ok(_) | Err(EngineError::IllegalTransition(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.conclude(node.id).await?;

        let (status, failure) = if node.is_absorbed() {
            (Status::Succeeded, None)
        } else {
            (node.status, node.failure_info.clone())
        };
        self.complete_run(node.plan_execution_id, status, failure)
            .await
    }
}

/// Children a container must see concluded before it completes
fn expected_children(plan_node: &PlanNode) -> usize {
    match plan_node.facilitator {
        FacilitatorType::Children => plan_node.children.len(),
        FacilitatorType::Strategy => plan_node.strategy.as_ref().map_or(0, |s| s.iterations as usize),
        _ => 1,
    }
}

/// Applies one kind of adviser decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdviseHandler {
    NextStep,
    Retry,
    InterventionWait,
    EndPlan,
    MarkSuccess,
    Ignore,
}

impl AdviseHandler {
    pub fn for_type(advise_type: AdviseType) -> Result<Self, AdviserError> {
        Ok(match advise_type {
            AdviseType::NextStep => AdviseHandler::NextStep,
            AdviseType::Retry => AdviseHandler::Retry,
            AdviseType::InterventionWait => AdviseHandler::InterventionWait,
            AdviseType::EndPlan => AdviseHandler::EndPlan,
            AdviseType::MarkSuccess => AdviseHandler::MarkSuccess,
            AdviseType::Ignore => AdviseHandler::Ignore,
            AdviseType::Unknown => return Err(AdviserError::UnknownAdviseType(advise_type)),
        })
    }

    pub(crate) async fn handle(
        self,
        engine: &Engine,
        node: NodeExecution,
        response: &AdviserResponse,
    ) -> Result<(), EngineError> {
        match (self, response) {
            (AdviseHandler::NextStep, AdviserResponse::NextStep { next_node_id }) => {
                engine.advance(&node, next_node_id.as_deref()).await
            }

            (AdviseHandler::Ignore, AdviserResponse::Ignore { next_node_id }) => {
                let ignored = engine
                    .modify_node(node.id, |n| {
                        if n.failure_ignored {
                            return Ok(false);
                        }
                        n.failure_ignored = true;
                        Ok(true)
                    })
                    .await?;
                let node = match ignored {
                    Some(node) => node,
                    None => engine.load_node(node.id).await?,
                };
                engine.advance(&node, next_node_id.as_deref()).await
            }

            (AdviseHandler::MarkSuccess, AdviserResponse::MarkSuccess { next_node_id }) => {
                let node = if node.status.is_failure() {
                    let marked = engine
                        .transition_node(node.id, Status::Succeeded, |n| {
                            n.ended_at = Some(Utc::now());
                        })
                        .await?;
                    match marked {
                        Some(node) => node,
                        None => engine.load_node(node.id).await?,
                    }
                } else {
                    node
                };
                engine.advance(&node, next_node_id.as_deref()).await
            }

            (AdviseHandler::Retry, AdviserResponse::Retry { wait_secs, retry_ids }) => {
                let (_, plan_node) = engine.plan_node(&node).await?;
                let mut attempts = retry_ids.clone();
                attempts.push(node.id);
                let strategy = node.ambiance.current_level().and_then(|l| l.strategy);
                info!(
                    "Retrying node {} (attempt {}) in {}s",
                    node.identifier,
                    attempts.len() + 1,
                    wait_secs
                );
                engine
                    .queue_node(
                        &node.ambiance.clone_for_finish(),
                        &plan_node,
                        derive_id(node.id, "retry"),
                        node.previous_id,
                        attempts,
                        *wait_secs,
                        strategy,
                    )
                    .await?;
                engine.store().mark_retried(node.id).await?;
                engine.conclude(node.id).await
            }

            (AdviseHandler::InterventionWait, AdviserResponse::InterventionWait { timeout_secs }) => {
                let before = node.status;
                let waiting = engine
                    .transition_node(node.id, Status::InputWaiting, |n| {
                        n.status_before_wait = Some(before);
                    })
                    .await?;
                let waiting = waiting.unwrap_or(node);
                if let Some(timeout) = timeout_secs {
                    let expiry = AdviseEvent {
                        node_execution_id: waiting.id,
                        from_status: Status::InputWaiting,
                        to_status: Status::InputWaiting,
                        failure_info: waiting.failure_info.clone(),
                        retry_ids: waiting.retry_ids.clone(),
                        previous_adviser_expired: true,
                        manual: None,
                    };
                    engine
                        .publish(
                            &expiry,
                            Some(format!("advise-expired-{}", waiting.id)),
                            Duration::from_secs(*timeout),
                        )
                        .await?;
                }
                Ok(())
            }

            (AdviseHandler::EndPlan, AdviserResponse::EndPlan) => engine.end_plan(&node).await,

            (handler, response) => Err(EngineError::Plan(format!(
                "{:?} handler cannot apply {:?}",
                handler,
                response.advise_type()
            ))),
        }
    }
}
