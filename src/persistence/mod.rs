//! Persistence layer for engine documents
//!
//! Every document carries a `version`. Updates pass the document as it was
//! read; the store only writes when the stored version still matches and
//! bumps it, otherwise it reports [`StoreError::VersionConflict`].

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteStore;

use crate::core::{BarrierInstance, Interrupt, NodeExecution, RunRecord, Status};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Attempts for the read-modify-write loops of the bulk queries
const BULK_UPDATE_ATTEMPTS: usize = 5;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} {id} was modified concurrently (expected version {expected}, found {actual})")]
    VersionConflict {
        kind: &'static str,
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }

    /// Worth retrying the whole operation later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::VersionConflict { .. } | StoreError::Backend(_)
        )
    }

    fn not_found(kind: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    fn conflict(kind: &'static str, id: impl ToString, expected: u64, actual: u64) -> Self {
        StoreError::VersionConflict {
            kind,
            id: id.to_string(),
            expected,
            actual,
        }
    }
}

/// Node execution records
#[async_trait]
pub trait NodeExecutionStore: Send + Sync {
    /// Insert a new record; returns false when the id already exists
    async fn insert_node(&self, node: &NodeExecution) -> Result<bool, StoreError>;

    async fn get_node(&self, id: Uuid) -> Result<Option<NodeExecution>, StoreError>;

    /// Write `node` if the stored version equals `node.version`; returns the
    /// stored document with its new version
    async fn update_node(&self, node: &NodeExecution) -> Result<NodeExecution, StoreError>;

    /// All records of a run, in creation order
    async fn list_nodes(&self, plan_execution_id: Uuid) -> Result<Vec<NodeExecution>, StoreError>;

    /// Direct children of a node, in creation order
    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<NodeExecution>, StoreError>;

    /// Children of a node, optionally skipping attempts superseded by a retry
    async fn fetch_children(
        &self,
        parent_id: Uuid,
        include_old_retries: bool,
    ) -> Result<Vec<NodeExecution>, StoreError> {
        let children = self.list_children(parent_id).await?;
        Ok(children
            .into_iter()
            .filter(|c| include_old_retries || !c.old_retry)
            .collect())
    }

    /// Every descendant of a node, breadth first
    async fn fetch_descendants(
        &self,
        node_id: Uuid,
        include_old_retries: bool,
    ) -> Result<Vec<NodeExecution>, StoreError> {
        let mut result = Vec::new();
        let mut queue = VecDeque::from([node_id]);
        while let Some(id) = queue.pop_front() {
            for child in self.fetch_children(id, include_old_retries).await? {
                queue.push_back(child.id);
                result.push(child);
            }
        }
        Ok(result)
    }

    async fn count_children_with_status(
        &self,
        parent_id: Uuid,
        statuses: &[Status],
    ) -> Result<usize, StoreError> {
        Ok(self
            .fetch_children(parent_id, false)
            .await?
            .iter()
            .filter(|c| statuses.contains(&c.status))
            .count())
    }

    /// Records of a run that have not reached a final status
    async fn fetch_non_final(
        &self,
        plan_execution_id: Uuid,
    ) -> Result<Vec<NodeExecution>, StoreError> {
        Ok(self
            .list_nodes(plan_execution_id)
            .await?
            .into_iter()
            .filter(|n| !n.status.is_final())
            .collect())
    }

    /// Latest attempt of the node with the given identifier
    async fn fetch_by_identifier(
        &self,
        plan_execution_id: Uuid,
        identifier: &str,
    ) -> Result<Option<NodeExecution>, StoreError> {
        Ok(self
            .list_nodes(plan_execution_id)
            .await?
            .into_iter()
            .filter(|n| n.identifier == identifier && !n.old_retry)
            .last())
    }

    /// Flag a node as superseded by a retry; false when it does not exist
    async fn mark_retried(&self, node_id: Uuid) -> Result<bool, StoreError> {
        for _ in 0..BULK_UPDATE_ATTEMPTS {
            let Some(mut node) = self.get_node(node_id).await? else {
                return Ok(false);
            };
            if node.old_retry {
                return Ok(true);
            }
            node.old_retry = true;
            match self.update_node(&node).await {
                Ok(_) => return Ok(true),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Backend(format!(
            "could not mark node {} as retried",
            node_id
        )))
    }

    /// Move every active node of a run that may legally error out to ERRORED.
    ///
    /// Returns the number of nodes changed.
    async fn error_out_active_nodes(&self, plan_execution_id: Uuid) -> Result<usize, StoreError> {
        let mut changed = 0;
        for node in self.fetch_non_final(plan_execution_id).await? {
            let mut current = node;
            for _ in 0..BULK_UPDATE_ATTEMPTS {
                if !current.status.can_transition_to(Status::Errored) {
                    break;
                }
                let mut next = current.clone();
                next.status = Status::Errored;
                next.ended_at = Some(Utc::now());
                match self.update_node(&next).await {
                    Ok(_) => {
                        changed += 1;
                        break;
                    }
                    Err(e) if e.is_conflict() => match self.get_node(current.id).await? {
                        Some(fresh) => current = fresh,
                        None => break,
                    },
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(changed)
    }
}

#[async_trait]
pub trait BarrierStore: Send + Sync {
    async fn insert_barrier(&self, barrier: &BarrierInstance) -> Result<bool, StoreError>;

    async fn get_barrier(
        &self,
        plan_execution_id: Uuid,
        identifier: &str,
    ) -> Result<Option<BarrierInstance>, StoreError>;

    async fn update_barrier(&self, barrier: &BarrierInstance) -> Result<BarrierInstance, StoreError>;

    async fn list_barriers(&self, plan_execution_id: Uuid) -> Result<Vec<BarrierInstance>, StoreError>;
}

#[async_trait]
pub trait InterruptStore: Send + Sync {
    async fn insert_interrupt(&self, interrupt: &Interrupt) -> Result<bool, StoreError>;

    async fn get_interrupt(&self, id: Uuid) -> Result<Option<Interrupt>, StoreError>;

    async fn update_interrupt(&self, interrupt: &Interrupt) -> Result<Interrupt, StoreError>;

    async fn list_interrupts(&self, plan_execution_id: Uuid) -> Result<Vec<Interrupt>, StoreError>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert_run(&self, run: &RunRecord) -> Result<bool, StoreError>;

    async fn get_run(&self, plan_execution_id: Uuid) -> Result<Option<RunRecord>, StoreError>;

    async fn update_run(&self, run: &RunRecord) -> Result<RunRecord, StoreError>;

    /// Most recent runs first
    async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError>;
}

/// Everything the engine needs from storage
pub trait ExecutionStore: NodeExecutionStore + BarrierStore + InterruptStore + RunStore {}

impl<T> ExecutionStore for T where T: NodeExecutionStore + BarrierStore + InterruptStore + RunStore {}

/// Documents that carry an optimistic concurrency version
trait Versioned: Clone {
    const KIND: &'static str;
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

impl Versioned for NodeExecution {
    const KIND: &'static str = "node execution";
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl Versioned for BarrierInstance {
    const KIND: &'static str = "barrier";
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl Versioned for Interrupt {
    const KIND: &'static str = "interrupt";
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl Versioned for RunRecord {
    const KIND: &'static str = "run";
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Compare-and-swap of one document inside a map
fn swap_versioned<K, D>(map: &mut HashMap<K, D>, key: K, doc: &D, id: impl ToString) -> Result<D, StoreError>
where
    K: std::hash::Hash + Eq,
    D: Versioned,
{
    let stored = map
        .get_mut(&key)
        .ok_or_else(|| StoreError::not_found(D::KIND, id.to_string()))?;
    if stored.version() != doc.version() {
        return Err(StoreError::conflict(
            D::KIND,
            id,
            doc.version(),
            stored.version(),
        ));
    }
    let mut next = doc.clone();
    next.set_version(doc.version() + 1);
    *stored = next.clone();
    Ok(next)
}

/// In-memory store (for tests and dry runs)
pub struct InMemoryStore {
    nodes: RwLock<HashMap<Uuid, NodeExecution>>,
    node_order: RwLock<Vec<Uuid>>,
    barriers: RwLock<HashMap<(Uuid, String), BarrierInstance>>,
    interrupts: RwLock<HashMap<Uuid, Interrupt>>,
    runs: RwLock<HashMap<Uuid, RunRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            node_order: RwLock::new(Vec::new()),
            barriers: RwLock::new(HashMap::new()),
            interrupts: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
        }
    }

    async fn ordered_nodes<F>(&self, filter: F) -> Vec<NodeExecution>
    where
        F: Fn(&NodeExecution) -> bool + Send,
    {
        let nodes = self.nodes.read().await;
        let order = self.node_order.read().await;
        order
            .iter()
            .filter_map(|id| nodes.get(id))
            .filter(|n| filter(n))
            .cloned()
            .collect()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeExecutionStore for InMemoryStore {
    async fn insert_node(&self, node: &NodeExecution) -> Result<bool, StoreError> {
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&node.id) {
            return Ok(false);
        }
        nodes.insert(node.id, node.clone());
        self.node_order.write().await.push(node.id);
        Ok(true)
    }

    async fn get_node(&self, id: Uuid) -> Result<Option<NodeExecution>, StoreError> {
        Ok(self.nodes.read().await.get(&id).cloned())
    }

    async fn update_node(&self, node: &NodeExecution) -> Result<NodeExecution, StoreError> {
        let mut nodes = self.nodes.write().await;
        let mut next = node.clone();
        next.last_updated_at = Utc::now();
        swap_versioned(&mut nodes, node.id, &next, node.id)
    }

    async fn list_nodes(&self, plan_execution_id: Uuid) -> Result<Vec<NodeExecution>, StoreError> {
        Ok(self
            .ordered_nodes(|n| n.plan_execution_id == plan_execution_id)
            .await)
    }

    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<NodeExecution>, StoreError> {
        Ok(self
            .ordered_nodes(|n| n.parent_id == Some(parent_id))
            .await)
    }
}

#[async_trait]
impl BarrierStore for InMemoryStore {
    async fn insert_barrier(&self, barrier: &BarrierInstance) -> Result<bool, StoreError> {
        let mut barriers = self.barriers.write().await;
        let key = (barrier.plan_execution_id, barrier.identifier.clone());
        if barriers.contains_key(&key) {
            return Ok(false);
        }
        barriers.insert(key, barrier.clone());
        Ok(true)
    }

    async fn get_barrier(
        &self,
        plan_execution_id: Uuid,
        identifier: &str,
    ) -> Result<Option<BarrierInstance>, StoreError> {
        Ok(self
            .barriers
            .read()
            .await
            .get(&(plan_execution_id, identifier.to_string()))
            .cloned())
    }

    async fn update_barrier(&self, barrier: &BarrierInstance) -> Result<BarrierInstance, StoreError> {
        let mut barriers = self.barriers.write().await;
        let key = (barrier.plan_execution_id, barrier.identifier.clone());
        swap_versioned(&mut barriers, key, barrier, &barrier.identifier)
    }

    async fn list_barriers(&self, plan_execution_id: Uuid) -> Result<Vec<BarrierInstance>, StoreError> {
        let barriers = self.barriers.read().await;
        let mut result: Vec<_> = barriers
            .values()
            .filter(|b| b.plan_execution_id == plan_execution_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(result)
    }
}

#[async_trait]
impl InterruptStore for InMemoryStore {
    async fn insert_interrupt(&self, interrupt: &Interrupt) -> Result<bool, StoreError> {
        let mut interrupts = self.interrupts.write().await;
        if interrupts.contains_key(&interrupt.id) {
            return Ok(false);
        }
        interrupts.insert(interrupt.id, interrupt.clone());
        Ok(true)
    }

    async fn get_interrupt(&self, id: Uuid) -> Result<Option<Interrupt>, StoreError> {
        Ok(self.interrupts.read().await.get(&id).cloned())
    }

    async fn update_interrupt(&self, interrupt: &Interrupt) -> Result<Interrupt, StoreError> {
        let mut interrupts = self.interrupts.write().await;
        swap_versioned(&mut interrupts, interrupt.id, interrupt, interrupt.id)
    }

    async fn list_interrupts(&self, plan_execution_id: Uuid) -> Result<Vec<Interrupt>, StoreError> {
        let interrupts = self.interrupts.read().await;
        let mut result: Vec<_> = interrupts
            .values()
            .filter(|i| i.plan_execution_id == plan_execution_id)
            .cloned()
            .collect();
        result.sort_by_key(|i| i.created_at);
        Ok(result)
    }
}

#[async_trait]
impl RunStore for InMemoryStore {
    async fn insert_run(&self, run: &RunRecord) -> Result<bool, StoreError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.plan_execution_id) {
            return Ok(false);
        }
        runs.insert(run.plan_execution_id, run.clone());
        Ok(true)
    }

    async fn get_run(&self, plan_execution_id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.runs.read().await.get(&plan_execution_id).cloned())
    }

    async fn update_run(&self, run: &RunRecord) -> Result<RunRecord, StoreError> {
        let mut runs = self.runs.write().await;
        swap_versioned(&mut runs, run.plan_execution_id, run, run.plan_execution_id)
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let runs = self.runs.read().await;
        let mut result: Vec<_> = runs.values().cloned().collect();
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        result.truncate(limit);
        Ok(result)
    }
}
