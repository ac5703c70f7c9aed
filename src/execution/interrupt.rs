//! Interrupt registration and processing
//!
//! An interrupt is validated when it is submitted, so misuse is reported to
//! the caller right away, and validated again when its message is processed
//! since the run may have moved on in between. A rejected interrupt is
//! recorded as DISCARDED and never touches node state. A redelivered
//! interrupt whose effect is already recorded on its target is completed
//! without the second check.

use crate::core::{Interrupt, InterruptState, InterruptType, NodeExecution, RunRecord, Status};
use crate::execution::engine::Engine;
use crate::execution::error::{EngineError, InterruptRejection};
use crate::execution::events::{
    AdviseEvent, ExecutionEvent, InterruptEvent, NodeStartEvent, SdkResponseEvent,
};
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl Engine {
    /// Register an interrupt against a run, or one node execution of it.
    ///
    /// Returns the interrupt id; the effect is applied asynchronously by the
    /// interrupt consumer.
    pub async fn submit_interrupt(
        &self,
        interrupt_type: InterruptType,
        plan_execution_id: Uuid,
        node_execution_id: Option<Uuid>,
    ) -> Result<Uuid, EngineError> {
        let mut interrupt = Interrupt::new(interrupt_type, plan_execution_id, node_execution_id);

        match self.check_interrupt(&interrupt).await {
            Ok(_) => {}
            Err(EngineError::Interrupt(rejection)) => {
                warn!("{} interrupt rejected: {}", interrupt_type, rejection);
                interrupt.mark_discarded(rejection.to_string());
                self.store().insert_interrupt(&interrupt).await?;
                self.emit(ExecutionEvent::InterruptRejected {
                    interrupt_id: interrupt.id,
                    interrupt_type,
                    reason: rejection.to_string(),
                });
                return Err(rejection.into());
            }
            Err(e) => return Err(e),
        }

        self.store().insert_interrupt(&interrupt).await?;
        let event = InterruptEvent {
            interrupt_id: interrupt.id,
            interrupt_type,
            plan_execution_id,
            node_execution_id,
        };
        self.publish(&event, Some(format!("interrupt-{}", interrupt.id)), Duration::ZERO)
            .await?;
        info!(
            "{} interrupt {} registered for run {}",
            interrupt_type, interrupt.id, plan_execution_id
        );
        Ok(interrupt.id)
    }

    pub async fn interrupt(&self, interrupt_id: Uuid) -> Result<Option<Interrupt>, EngineError> {
        Ok(self.store().get_interrupt(interrupt_id).await?)
    }

    pub(crate) async fn handle_interrupt(&self, event: InterruptEvent) -> Result<(), EngineError> {
        let Some(interrupt) = self.store().get_interrupt(event.interrupt_id).await? else {
            warn!("Interrupt {} not found", event.interrupt_id);
            return Ok(());
        };
        if interrupt.is_consumed() {
            debug!("Interrupt {} already consumed", interrupt.id);
            return Ok(());
        }
        let applied = match interrupt.state {
            InterruptState::Processing => self.applied_target(&interrupt).await?,
            _ => None,
        };
        if interrupt.state == InterruptState::Registered {
            self.modify_interrupt(interrupt.id, |i| {
                if i.state != InterruptState::Registered {
                    return false;
                }
                i.state = InterruptState::Processing;
                true
            })
            .await?;
        }

        let result = match applied {
            Some(target) => self.reapply(&interrupt, &target).await,
            None => self.apply_interrupt(&interrupt).await,
        };
        match result {
            Ok(()) => {
                self.modify_interrupt(interrupt.id, |i| {
                    if i.is_consumed() {
                        return false;
                    }
                    i.mark_processed();
                    true
                })
                .await?;
                info!("{} interrupt {} processed", interrupt.interrupt_type, interrupt.id);
                self.emit(ExecutionEvent::InterruptProcessed {
                    interrupt_id: interrupt.id,
                    interrupt_type: interrupt.interrupt_type,
                });
                Ok(())
            }
            Err(EngineError::Interrupt(rejection)) => {
                warn!(
                    "{} interrupt {} discarded: {}",
                    interrupt.interrupt_type, interrupt.id, rejection
                );
                self.modify_interrupt(interrupt.id, |i| {
                    if i.is_consumed() {
                        return false;
                    }
                    i.mark_discarded(rejection.to_string());
                    true
                })
                .await?;
                self.emit(ExecutionEvent::InterruptRejected {
                    interrupt_id: interrupt.id,
                    interrupt_type: interrupt.interrupt_type,
                    reason: rejection.to_string(),
                });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Validate an interrupt against the current run state; returns the run
    /// and the targeted node
    async fn check_interrupt(&self, interrupt: &Interrupt) -> Result<(RunRecord, NodeExecution), EngineError> {
        let pid = interrupt.plan_execution_id;
        let Some(run) = self.store().get_run(pid).await? else {
            return Err(InterruptRejection::RunNotFound(pid).into());
        };
        if run.is_finished() {
            return Err(InterruptRejection::RunFinished(pid).into());
        }

        if interrupt.interrupt_type.is_intervention() && interrupt.node_execution_id.is_none() {
            return Err(InterruptRejection::MissingTarget(interrupt.interrupt_type.to_string()).into());
        }
        let target_id = interrupt.node_execution_id.unwrap_or(run.root_node_id);
        let target = match self.store().get_node(target_id).await? {
            Some(node) if node.plan_execution_id == pid => node,
            _ => return Err(InterruptRejection::NodeNotFound(target_id).into()),
        };

        let paused = interrupt.interrupt_type == InterruptType::Resume
            && self.has_paused(&run, &target).await?;

        match interrupt.interrupt_type {
            InterruptType::Abort | InterruptType::Pause if target.status.is_final() => {
                Err(InterruptRejection::AlreadyFinished(target.id).into())
            }
            InterruptType::Resume if !paused => {
                Err(InterruptRejection::NotPaused.into())
            }
            t if t.is_intervention() && target.status != Status::InputWaiting => {
                Err(InterruptRejection::NotWaitingForInput {
                    status: target.status,
                }
                .into())
            }
            _ => Ok((run, target)),
        }
    }

    async fn has_paused(&self, run: &RunRecord, target: &NodeExecution) -> Result<bool, EngineError> {
        let subtree = self.subtree(target).await?;
        Ok(subtree.iter().any(|n| {
            run.pause_scopes.contains(&n.id)
                || matches!(n.status, Status::Paused | Status::Pausing)
        }))
    }

    /// A node and its descendants, parents before children
    async fn subtree(&self, node: &NodeExecution) -> Result<Vec<NodeExecution>, EngineError> {
        let mut nodes = vec![node.clone()];
        nodes.extend(self.store().fetch_descendants(node.id, false).await?);
        Ok(nodes)
    }

    async fn apply_interrupt(&self, interrupt: &Interrupt) -> Result<(), EngineError> {
        let (_, target) = self.check_interrupt(interrupt).await?;
        match interrupt.interrupt_type {
            InterruptType::Abort => self.abort(interrupt, &target).await,
            InterruptType::Pause => self.pause(interrupt, &target).await,
            InterruptType::Resume => self.resume(interrupt, &target).await,
            InterruptType::Retry | InterruptType::MarkSuccess | InterruptType::Ignore => {
                self.intervene(interrupt, &target).await
            }
        }
    }

    /// Target of an interrupt whose effect an earlier delivery already
    /// recorded somewhere in the target's subtree
    async fn applied_target(&self, interrupt: &Interrupt) -> Result<Option<NodeExecution>, EngineError> {
        let target_id = match interrupt.node_execution_id {
            Some(id) => id,
            None => match self.store().get_run(interrupt.plan_execution_id).await? {
                Some(run) => run.root_node_id,
                None => return Ok(None),
            },
        };
        let Some(target) = self.store().get_node(target_id).await? else {
            return Ok(None);
        };
        let applied = self
            .subtree(&target)
            .await?
            .iter()
            .any(|n| n.interrupt_history.iter().any(|e| e.interrupt_id == interrupt.id));
        Ok(applied.then_some(target))
    }

    /// Finish an interrupt that was applied before its delivery was lost.
    /// The run may have moved on, so the interrupt is not checked again.
    async fn reapply(&self, interrupt: &Interrupt, target: &NodeExecution) -> Result<(), EngineError> {
        debug!(
            "{} interrupt {} already applied to {}",
            interrupt.interrupt_type, interrupt.id, target.id
        );
        match interrupt.interrupt_type {
            InterruptType::Abort => self.abort(interrupt, target).await,
            t if t.is_intervention() => self.intervene(interrupt, target).await,
            _ => Ok(()),
        }
    }

    async fn abort(&self, interrupt: &Interrupt, target: &NodeExecution) -> Result<(), EngineError> {
        let mut aborted = 0;
        for node in self.subtree(target).await? {
            if !node.status.is_active() {
                continue;
            }
            let result = self
                .transition_node(node.id, Status::Aborted, |n| {
                    n.ended_at = Some(Utc::now());
                    n.record_interrupt(interrupt.id, InterruptType::Abort);
                })
                .await;
            match result {
                Ok(Some(_)) => aborted += 1,
                Ok(None) | Err(EngineError::IllegalTransition(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!("Abort {} stopped {} node executions", interrupt.id, aborted);

        let target = self.load_node(target.id).await?;
        if target.status == Status::Aborted && !target.concluded {
            self.finish_node(&target).await?;
        }
        Ok(())
    }

    async fn pause(&self, interrupt: &Interrupt, target: &NodeExecution) -> Result<(), EngineError> {
        self.modify_run(interrupt.plan_execution_id, |run| Ok(run.pause_scopes.insert(target.id)))
            .await?;

        let plan = self.plan_for(interrupt.plan_execution_id).await?;
        for node in self.subtree(target).await? {
            let is_leaf = plan
                .node(&node.plan_node_id)
                .map_or(false, |p| !p.facilitator.is_container());
            let to = match node.status {
                Status::Queued => Status::Paused,
                s if s.is_executing() && is_leaf => Status::Pausing,
                _ => continue,
            };
            self.transition_node(node.id, to, |n| {
                n.record_interrupt(interrupt.id, InterruptType::Pause);
            })
            .await?;
        }
        Ok(())
    }

    async fn resume(&self, interrupt: &Interrupt, target: &NodeExecution) -> Result<(), EngineError> {
        let subtree = self.subtree(target).await?;
        let ids: Vec<Uuid> = subtree.iter().map(|n| n.id).collect();

        let mut changed = self
            .modify_run(interrupt.plan_execution_id, |run| {
                let before = run.pause_scopes.len();
                run.pause_scopes.retain(|id| !ids.contains(id));
                Ok(run.pause_scopes.len() != before)
            })
            .await?
            .is_some();

        for node in subtree {
            match node.status {
                Status::Pausing => {
                    self.transition_node(node.id, Status::Resumed, |n| {
                        n.record_interrupt(interrupt.id, InterruptType::Resume);
                    })
                    .await?;
                    changed = true;
                }
                Status::Paused if node.has_started() => {
                    let resumed = self
                        .transition_node(node.id, Status::Resumed, |n| {
                            n.record_interrupt(interrupt.id, InterruptType::Resume);
                        })
                        .await?;
                    changed = true;
                    let held = resumed.and_then(|n| n.held_response);
                    if let Some(outcome) = held {
                        let event = SdkResponseEvent::StepResponse {
                            node_execution_id: node.id,
                            outcome,
                        };
                        self.publish(
                            &event,
                            Some(format!("response-{}-{}", node.id, interrupt.id)),
                            Duration::ZERO,
                        )
                        .await?;
                    }
                }
                Status::Paused => {
                    let queued = self
                        .transition_node(node.id, Status::Queued, |n| {
                            n.record_interrupt(interrupt.id, InterruptType::Resume);
                        })
                        .await?;
                    changed = true;
                    if let Some(queued) = queued {
                        let event = NodeStartEvent {
                            node_execution_id: queued.id,
                            ambiance: queued.ambiance.clone(),
                        };
                        self.publish(
                            &event,
                            Some(format!("start-{}-{}", queued.id, interrupt.id)),
                            Duration::ZERO,
                        )
                        .await?;
                    }
                }
                _ => {}
            }
        }

        if !changed {
            return Err(InterruptRejection::NotPaused.into());
        }
        Ok(())
    }

    /// Resolve a manual intervention wait as if the adviser had decided
    async fn intervene(&self, interrupt: &Interrupt, target: &NodeExecution) -> Result<(), EngineError> {
        let Some(decision) = interrupt.interrupt_type.decision() else {
            return Ok(());
        };
        self.modify_node(target.id, |n| {
            if n.interrupt_history.iter().any(|e| e.interrupt_id == interrupt.id) {
                return Ok(false);
            }
            n.record_interrupt(interrupt.id, interrupt.interrupt_type);
            Ok(true)
        })
        .await?;

        let event = AdviseEvent {
            node_execution_id: target.id,
            from_status: Status::InputWaiting,
            to_status: Status::InputWaiting,
            failure_info: target.failure_info.clone(),
            retry_ids: target.retry_ids.clone(),
            previous_adviser_expired: false,
            manual: Some(decision),
        };
        self.publish(
            &event,
            Some(format!("advise-{}-{}", target.id, interrupt.id)),
            Duration::ZERO,
        )
        .await?;
        Ok(())
    }

    async fn modify_interrupt<F>(&self, id: Uuid, mut change: F) -> Result<(), EngineError>
    where
        F: FnMut(&mut Interrupt) -> bool + Send,
    {
        let attempts = self.config().occ_max_attempts;
        for attempt in 0..attempts {
            let Some(mut interrupt) = self.store().get_interrupt(id).await? else {
                return Ok(());
            };
            if !change(&mut interrupt) {
                return Ok(());
            }
            match self.store().update_interrupt(&interrupt).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    tokio::time::sleep(self.config().backoff(attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::ConflictRetriesExhausted {
            kind: "interrupt",
            id: id.to_string(),
            attempts,
        })
    }
}
