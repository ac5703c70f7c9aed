//! Barrier coordination across parallel branches
//!
//! Every branch that reaches a barrier step records its arrival on the
//! barrier document with an optimistic write. The write that records the
//! last outstanding position also flips the barrier down, so exactly one
//! arrival observes the release and wakes the waiting branches.

use crate::core::{BarrierInstance, NodeExecution, Plan, StepOutcome};
use crate::core::barrier::Arrival;
use crate::execution::engine::{Engine, EngineConfig};
use crate::execution::error::EngineError;
use crate::execution::events::{ExecutionEvent, SdkResponseEvent};
use crate::persistence::ExecutionStore;
use serde_json::Map;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Result of a branch arriving at a barrier
#[derive(Debug, Clone, PartialEq)]
pub enum DropOutcome {
    /// Recorded; other positions are still outstanding
    Waiting { outstanding: usize },
    /// This arrival released the barrier
    Released(BarrierInstance),
    /// The barrier was already down
    AlreadyReleased(BarrierInstance),
    /// No position of the barrier matches the node
    NotParticipating,
}

pub struct BarrierCoordinator {
    store: Arc<dyn ExecutionStore>,
    config: EngineConfig,
}

impl BarrierCoordinator {
    pub fn new(store: Arc<dyn ExecutionStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            config: config.clone(),
        }
    }

    /// Create one standing barrier per barrier identifier of the plan
    pub async fn create_for_run(&self, plan_execution_id: Uuid, plan: &Plan) -> Result<usize, EngineError> {
        let mut created = 0;
        for info in plan.barrier_setup_info() {
            let barrier = BarrierInstance::new(plan_execution_id, &info);
            if self.store.insert_barrier(&barrier).await? {
                debug!(
                    "Barrier {} created with {} positions",
                    barrier.identifier,
                    barrier.positions.len()
                );
                created += 1;
            }
        }
        Ok(created)
    }

    /// Expand template positions of a strategy execution in every barrier
    /// that has some
    pub async fn expand_strategy(
        &self,
        plan_execution_id: Uuid,
        strategy_setup_id: &str,
        strategy_runtime_id: Uuid,
        iteration_runtime_ids: &[Uuid],
    ) -> Result<(), EngineError> {
        let barriers = self.store.list_barriers(plan_execution_id).await?;
        for barrier in barriers {
            if !barrier.has_templates_for(strategy_setup_id) {
                continue;
            }
            self.modify(plan_execution_id, &barrier.identifier, |b| {
                Ok(b.expand_strategy(strategy_setup_id, strategy_runtime_id, iteration_runtime_ids))
            })
            .await?;
        }
        Ok(())
    }

    /// Record the arrival of `node` at the barrier `identifier`
    pub async fn drop(
        &self,
        plan_execution_id: Uuid,
        identifier: &str,
        node: &NodeExecution,
    ) -> Result<DropOutcome, EngineError> {
        for attempt in 0..self.config.occ_max_attempts {
            let mut barrier = self.load(plan_execution_id, identifier).await?;

            match barrier.arrive(&node.plan_node_id, &node.ambiance) {
                Arrival::Unknown => return Ok(DropOutcome::NotParticipating),
                Arrival::Duplicate if barrier.is_down() => {
                    return Ok(DropOutcome::AlreadyReleased(barrier))
                }
                Arrival::Duplicate => {
                    return Ok(DropOutcome::Waiting {
                        outstanding: barrier.outstanding(),
                    })
                }
                Arrival::Recorded if barrier.is_down() => {
                    return Ok(DropOutcome::AlreadyReleased(barrier))
                }
                Arrival::Recorded => {}
            }

            let outstanding = barrier.outstanding();
            if outstanding == 0 {
                barrier.release();
            }

            match self.store.update_barrier(&barrier).await {
                Ok(stored) if outstanding == 0 => return Ok(DropOutcome::Released(stored)),
                Ok(_) => return Ok(DropOutcome::Waiting { outstanding }),
                Err(e) if e.is_conflict() => {
                    debug!("Conflict at barrier {} (attempt {})", identifier, attempt + 1);
                    tokio::time::sleep(self.config.backoff(attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::ConflictRetriesExhausted {
            kind: "barrier",
            id: identifier.to_string(),
            attempts: self.config.occ_max_attempts,
        })
    }

    async fn load(&self, plan_execution_id: Uuid, identifier: &str) -> Result<BarrierInstance, EngineError> {
        self.store
            .get_barrier(plan_execution_id, identifier)
            .await?
            .ok_or_else(|| EngineError::Plan(format!("barrier '{}' not found", identifier)))
    }

    async fn modify<F>(&self, plan_execution_id: Uuid, identifier: &str, mut change: F) -> Result<(), EngineError>
    where
        F: FnMut(&mut BarrierInstance) -> Result<bool, EngineError> + Send,
    {
        for attempt in 0..self.config.occ_max_attempts {
            let mut barrier = self.load(plan_execution_id, identifier).await?;
            if !change(&mut barrier)? {
                return Ok(());
            }
            match self.store.update_barrier(&barrier).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    tokio::time::sleep(self.config.backoff(attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::ConflictRetriesExhausted {
            kind: "barrier",
            id: identifier.to_string(),
            attempts: self.config.occ_max_attempts,
        })
    }
}

impl Engine {
    /// Complete every node waiting at a released barrier
    pub(crate) async fn release_barrier(&self, barrier: &BarrierInstance) -> Result<(), EngineError> {
        let mut released = 0;
        for node_id in barrier.waiting_nodes() {
            let event = SdkResponseEvent::StepResponse {
                node_execution_id: node_id,
                outcome: StepOutcome::succeeded(Map::new()),
            };
            let notify_id = format!("barrier-{}-{}", barrier.id, node_id);
            if self.publish(&event, Some(notify_id), Duration::ZERO).await? {
                released += 1;
            }
        }

        if released > 0 {
            info!(
                "Barrier {} released {} waiting nodes",
                barrier.identifier, released
            );
            self.emit(ExecutionEvent::BarrierReleased {
                plan_execution_id: barrier.plan_execution_id,
                identifier: barrier.identifier.clone(),
                released,
            });
        }
        Ok(())
    }
}
