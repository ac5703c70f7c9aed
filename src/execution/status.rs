//! Status updates under optimistic concurrency control
//!
//! Every change to a node execution goes through [`Engine::modify_node`]: read
//! the document, apply the change to a copy, check the status transition
//! against the graph and write with the version that was read. A stale write
//! re-reads and tries again. Accepted status changes are reported to the
//! registered observers, the broadcast channel and the event handlers.

use crate::core::{NodeExecution, RunRecord, Status};
use crate::execution::engine::Engine;
use crate::execution::error::EngineError;
use crate::execution::events::ExecutionEvent;
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

/// An accepted status change
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub node_execution_id: Uuid,
    pub plan_execution_id: Uuid,
    pub identifier: String,
    pub from: Status,
    pub to: Status,
    /// Version written by this change
    pub version: u64,
    pub at: DateTime<Utc>,
}

/// Called synchronously after every accepted status change
pub trait StatusObserver: Send + Sync {
    fn on_status_update(&self, update: &StatusUpdate);
}

impl<F> StatusObserver for F
where
    F: Fn(&StatusUpdate) + Send + Sync,
{
    fn on_status_update(&self, update: &StatusUpdate) {
        self(update)
    }
}

impl Engine {
    /// Read-modify-write of one node execution.
    ///
    /// `change` returns false when there is nothing to do (the change was
    /// already applied); the node is then returned unchanged as `None`.
    pub(crate) async fn modify_node<F>(
        &self,
        id: Uuid,
        mut change: F,
    ) -> Result<Option<NodeExecution>, EngineError>
    where
        F: FnMut(&mut NodeExecution) -> Result<bool, EngineError> + Send,
    {
        let attempts = self.config().occ_max_attempts;
        for attempt in 0..attempts {
            let current = self.load_node(id).await?;
            let mut next = current.clone();
            if !change(&mut next)? {
                return Ok(None);
            }
            if next.status != current.status {
                current.status.check_transition(next.status)?;
            }

            match self.store().update_node(&next).await {
                Ok(stored) => {
                    if stored.status != current.status {
                        self.notify_status(&stored, current.status);
                    }
                    return Ok(Some(stored));
                }
                Err(e) if e.is_conflict() => {
                    debug!("Conflict updating node {} (attempt {})", id, attempt + 1);
                    tokio::time::sleep(self.config().backoff(attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::ConflictRetriesExhausted {
            kind: "node execution",
            id: id.to_string(),
            attempts,
        })
    }

    /// Move a node to `to`, applying `extra` in the same write.
    ///
    /// Returns `None` when the node already has that status.
    pub(crate) async fn transition_node<F>(
        &self,
        id: Uuid,
        to: Status,
        mut extra: F,
    ) -> Result<Option<NodeExecution>, EngineError>
    where
        F: FnMut(&mut NodeExecution) + Send,
    {
        self.modify_node(id, |node| {
            if node.status == to {
                return Ok(false);
            }
            node.status.check_transition(to)?;
            node.status = to;
            extra(node);
            Ok(true)
        })
        .await
    }

    /// Read-modify-write of a run record, same contract as [`Engine::modify_node`]
    pub(crate) async fn modify_run<F>(
        &self,
        plan_execution_id: Uuid,
        mut change: F,
    ) -> Result<Option<RunRecord>, EngineError>
    where
        F: FnMut(&mut RunRecord) -> Result<bool, EngineError> + Send,
    {
        let attempts = self.config().occ_max_attempts;
        for attempt in 0..attempts {
            let mut run = self
                .store()
                .get_run(plan_execution_id)
                .await?
                .ok_or(EngineError::UnknownRun(plan_execution_id))?;
            if !change(&mut run)? {
                return Ok(None);
            }
            match self.store().update_run(&run).await {
                Ok(stored) => return Ok(Some(stored)),
                Err(e) if e.is_conflict() => {
                    tokio::time::sleep(self.config().backoff(attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::ConflictRetriesExhausted {
            kind: "run",
            id: plan_execution_id.to_string(),
            attempts,
        })
    }

    fn notify_status(&self, node: &NodeExecution, from: Status) {
        info!(
            "Node {} ({}) {} -> {}",
            node.identifier, node.id, from, node.status
        );
        let update = StatusUpdate {
            node_execution_id: node.id,
            plan_execution_id: node.plan_execution_id,
            identifier: node.identifier.clone(),
            from,
            to: node.status,
            version: node.version,
            at: node.last_updated_at,
        };
        for observer in self.observers() {
            observer.on_status_update(&update);
        }
        // No subscribers is fine
        let _ = self.status_sender().send(update);
        self.emit(ExecutionEvent::NodeStatusChanged {
            plan_execution_id: node.plan_execution_id,
            node_execution_id: node.id,
            identifier: node.identifier.clone(),
            from,
            to: node.status,
        });
    }
}
