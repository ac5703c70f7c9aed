//! Main execution engine - drives runs through the message queue
//!
//! The engine never walks a plan on one call stack. Every step of a node's
//! life (start, facilitate, response, advise) is a message on its own topic,
//! and every consumer only reads and writes persisted documents. Any number
//! of consumers may therefore work on the same run.

use crate::core::{
    Ambiance, FailureInfo, Level, NodeExecution, Plan, PlanNode, RunRecord, Status,
    StepOutcome, StrategyMetadata,
};
use crate::execution::barrier::BarrierCoordinator;
use crate::execution::error::EngineError;
use crate::execution::events::{
    AdviseEvent, EventHandler, ExecutionEvent, FacilitatorEvent, NodeStartEvent, SdkResponseEvent,
};
use crate::execution::executor::{ExecutorRegistry, StepExecutor};
use crate::execution::queue::{Message, MessageQueue, Payload, Topic};
use crate::execution::status::{StatusObserver, StatusUpdate};
use crate::persistence::ExecutionStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Attempts of a read-modify-write before giving up
    pub occ_max_attempts: usize,
    /// Base delay between conflicting writes, grows linearly per attempt
    pub occ_backoff: Duration,
    /// Delay before a message that hit a transient error is redelivered
    pub redelivery_delay: Duration,
    /// Deliveries of one message before it is dropped
    pub max_deliveries: u32,
    /// Sleep of an idle consumer before it polls again
    pub idle_poll_interval: Duration,
    /// Upper bound of messages handled by one `run_until_idle` call
    pub max_pump_iterations: usize,
    /// Steps running longer than this end EXPIRED
    pub step_timeout: Option<Duration>,
    /// Capacity of the status update broadcast channel
    pub status_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            occ_max_attempts: 8,
            occ_backoff: Duration::from_millis(5),
            redelivery_delay: Duration::from_millis(100),
            max_deliveries: 5,
            idle_poll_interval: Duration::from_millis(50),
            max_pump_iterations: 100_000,
            step_timeout: None,
            status_channel_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn with_occ(mut self, max_attempts: usize, backoff: Duration) -> Self {
        self.occ_max_attempts = max_attempts.max(1);
        self.occ_backoff = backoff;
        self
    }

    pub fn with_redelivery(mut self, delay: Duration, max_deliveries: u32) -> Self {
        self.redelivery_delay = delay;
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    pub fn with_idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    pub fn with_max_pump_iterations(mut self, max: usize) -> Self {
        self.max_pump_iterations = max;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    /// Delay after the given failed attempt (zero based)
    pub fn backoff(&self, attempt: usize) -> Duration {
        self.occ_backoff * (attempt as u32 + 1)
    }
}

/// Builder for [`Engine`]
pub struct EngineBuilder {
    store: Arc<dyn ExecutionStore>,
    queue: Arc<dyn MessageQueue>,
    executors: ExecutorRegistry,
    config: EngineConfig,
    observers: Vec<Arc<dyn StatusObserver>>,
    event_handlers: Vec<EventHandler>,
}

impl EngineBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = executors;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.executors.register(executor);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn StatusObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Add an event handler
    pub fn with_event_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.event_handlers.push(Arc::new(handler));
        self
    }

    pub fn build(self) -> Engine {
        let (status_tx, _) = broadcast::channel(self.config.status_channel_capacity.max(1));
        let barriers = BarrierCoordinator::new(self.store.clone(), &self.config);
        Engine {
            store: self.store,
            queue: self.queue,
            executors: self.executors,
            config: self.config,
            observers: self.observers,
            event_handlers: self.event_handlers,
            status_tx,
            barriers,
            plans: RwLock::new(HashMap::new()),
        }
    }
}

/// Main execution engine
pub struct Engine {
    store: Arc<dyn ExecutionStore>,
    queue: Arc<dyn MessageQueue>,
    executors: ExecutorRegistry,
    config: EngineConfig,
    observers: Vec<Arc<dyn StatusObserver>>,
    event_handlers: Vec<EventHandler>,
    status_tx: broadcast::Sender<StatusUpdate>,
    barriers: BarrierCoordinator,
    plans: RwLock<HashMap<Uuid, Arc<Plan>>>,
}

impl Engine {
    pub fn builder(store: Arc<dyn ExecutionStore>, queue: Arc<dyn MessageQueue>) -> EngineBuilder {
        EngineBuilder {
            store,
            queue,
            executors: ExecutorRegistry::with_builtins(),
            config: EngineConfig::default(),
            observers: Vec::new(),
            event_handlers: Vec::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn MessageQueue> {
        &self.queue
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    pub(crate) fn barriers(&self) -> &BarrierCoordinator {
        &self.barriers
    }

    pub(crate) fn observers(&self) -> &[Arc<dyn StatusObserver>] {
        &self.observers
    }

    pub(crate) fn status_sender(&self) -> &broadcast::Sender<StatusUpdate> {
        &self.status_tx
    }

    /// Receive every accepted status change from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.status_tx.subscribe()
    }

    /// Emit an event to all handlers
    pub(crate) fn emit(&self, event: ExecutionEvent) {
        for handler in &self.event_handlers {
            handler(event.clone());
        }
    }

    /// Check the plan, create the run documents and queue the root node
    pub async fn start_run(&self, plan: Plan) -> Result<Uuid, EngineError> {
        plan.validate()?;
        let root = plan
            .root()
            .ok_or_else(|| EngineError::Plan(format!("root node '{}' not found", plan.root_node_id)))?
            .clone();

        let plan_execution_id = Uuid::new_v4();
        let root_id = derive_id(plan_execution_id, "root");
        info!(
            "Starting run {} of plan {} ({})",
            plan_execution_id, plan.name, plan.id
        );

        let run = RunRecord::new(plan_execution_id, plan.clone(), root_id);
        self.store.insert_run(&run).await?;
        self.barriers
            .create_for_run(plan_execution_id, &plan)
            .await?;

        let plan_id = plan.id.clone();
        let ambiance = Ambiance::new(plan_execution_id, &plan.id, plan.setup_abstractions.clone());
        self.plans
            .write()
            .await
            .insert(plan_execution_id, Arc::new(plan));

        self.emit(ExecutionEvent::RunStarted {
            plan_execution_id,
            plan_id,
        });
        self.queue_node(&ambiance, &root, root_id, None, Vec::new(), 0, None)
            .await?;

        Ok(plan_execution_id)
    }

    /// Complete a delegated or waiting step from outside
    pub async fn submit_task_response(
        &self,
        node_execution_id: Uuid,
        outcome: StepOutcome,
    ) -> Result<(), EngineError> {
        let node = self.load_node(node_execution_id).await?;
        if !node.status.is_active() {
            warn!(
                "Task response for node {} ignored, node is {}",
                node_execution_id, node.status
            );
            return Ok(());
        }
        let event = SdkResponseEvent::StepResponse {
            node_execution_id,
            outcome,
        };
        self.publish(&event, None, Duration::ZERO).await?;
        Ok(())
    }

    pub async fn run(&self, plan_execution_id: Uuid) -> Result<Option<RunRecord>, EngineError> {
        Ok(self.store.get_run(plan_execution_id).await?)
    }

    pub async fn nodes(&self, plan_execution_id: Uuid) -> Result<Vec<NodeExecution>, EngineError> {
        Ok(self.store.list_nodes(plan_execution_id).await?)
    }

    /// Handle at most one due message per topic; returns how many were handled
    pub async fn pump_once(&self) -> Result<usize, EngineError> {
        let mut handled = 0;
        for topic in Topic::ALL {
            if let Some(message) = self.queue.consume(topic).await? {
                self.dispatch(message).await?;
                handled += 1;
            }
        }
        Ok(handled)
    }

    /// Handle messages until no message is due
    pub async fn run_until_idle(&self) -> Result<usize, EngineError> {
        let mut total = 0;
        loop {
            let handled = self.pump_once().await?;
            if handled == 0 {
                return Ok(total);
            }
            total += handled;
            if total >= self.config.max_pump_iterations {
                warn!("Stopping pump after {} messages", total);
                return Ok(total);
            }
        }
    }

    /// Pump until the run finishes, sleeping through delayed messages.
    ///
    /// Returns early, with the run unfinished, when nothing is left to
    /// deliver (e.g. the run waits for an interrupt or a task response).
    pub async fn run_to_completion(&self, plan_execution_id: Uuid) -> Result<RunRecord, EngineError> {
        loop {
            self.run_until_idle().await?;
            let run = self
                .run(plan_execution_id)
                .await?
                .ok_or(EngineError::UnknownRun(plan_execution_id))?;
            if run.is_finished() {
                return Ok(run);
            }
            match self.queue.next_due().await {
                Some(due) => tokio::time::sleep_until(due).await,
                None => return Ok(run),
            }
        }
    }

    /// One consumer task per topic, until `shutdown` turns true
    pub fn spawn_consumers(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        Topic::ALL
            .into_iter()
            .map(|topic| {
                let engine = self.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    debug!("Consumer for {} started", topic);
                    while !*shutdown.borrow() {
                        match engine.queue.consume(topic).await {
                            Ok(Some(message)) => {
                                if let Err(e) = engine.dispatch(message).await {
                                    error!("Consumer for {} failed to settle a message: {}", topic, e);
                                }
                            }
                            Ok(None) => {
                                tokio::select! {
                                    _ = tokio::time::sleep(engine.config.idle_poll_interval) => {}
                                    _ = shutdown.changed() => {}
                                }
                            }
                            Err(e) => {
                                warn!("Consumer for {} could not poll: {}", topic, e);
                                tokio::time::sleep(engine.config.idle_poll_interval).await;
                            }
                        }
                    }
                    debug!("Consumer for {} stopped", topic);
                })
            })
            .collect()
    }

    async fn route(&self, message: &Message) -> Result<(), EngineError> {
        match message.topic {
            Topic::NodeStart => self.handle_node_start(message.decode()?).await,
            Topic::Facilitate => {
                self.handle_facilitate(message.decode()?, message.attempts)
                    .await
            }
            Topic::SdkResponse => self.handle_sdk_response(message.decode()?).await,
            Topic::NodeAdvise => self.handle_advise(message.decode()?).await,
            Topic::Interrupt => self.handle_interrupt(message.decode()?).await,
        }
    }

    /// Node a message is about, for errors that must be recorded on it
    fn target_node(message: &Message) -> Option<Uuid> {
        match message.topic {
            Topic::NodeStart => message
                .decode::<NodeStartEvent>()
                .ok()
                .map(|e| e.node_execution_id),
            Topic::Facilitate => message
                .decode::<FacilitatorEvent>()
                .ok()
                .map(|e| e.node_execution_id),
            Topic::SdkResponse => match message.decode::<SdkResponseEvent>().ok()? {
                SdkResponseEvent::StepResponse {
                    node_execution_id, ..
                } => Some(node_execution_id),
                SdkResponseEvent::ChildEnded { parent_id, .. } => Some(parent_id),
            },
            Topic::NodeAdvise => message
                .decode::<AdviseEvent>()
                .ok()
                .map(|e| e.node_execution_id),
            Topic::Interrupt => None,
        }
    }

    /// Run the handler of a message, then ack or nack it.
    ///
    /// A plan error is fatal to the node the message is about: it is recorded
    /// there and the message counts as handled.
    async fn dispatch(&self, message: Message) -> Result<(), EngineError> {
        let result = match self.route(&message).await {
            Err(EngineError::Plan(reason)) => match Self::target_node(&message) {
                Some(node_id) => {
                    error!(
                        "Plan error on {} message {} for node {}: {}",
                        message.topic, message.id, node_id, reason
                    );
                    self.fail_on_plan_error(node_id, &reason).await
                }
                None => Err(EngineError::Plan(reason)),
            },
            other => other,
        };
        match result {
            Ok(()) => self.queue.ack(message.id).await?,
            Err(e) if e.is_transient() && message.attempts < self.config.max_deliveries => {
                warn!(
                    "Transient error on {} message {} (delivery {}): {}",
                    message.topic, message.id, message.attempts, e
                );
                self.queue
                    .nack(message.id, self.config.redelivery_delay)
                    .await?;
            }
            Err(e) => {
                error!(
                    "Dropping {} message {} after {} deliveries: {}",
                    message.topic, message.id, message.attempts, e
                );
                self.queue.ack(message.id).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn publish<P: Payload>(
        &self,
        payload: &P,
        notify_id: Option<String>,
        delay: Duration,
    ) -> Result<bool, EngineError> {
        let message = Message::encode(payload, notify_id)?;
        let published = self.queue.publish(message, delay).await?;
        if !published {
            debug!("Duplicate {} message suppressed", P::TOPIC);
        }
        Ok(published)
    }

    pub(crate) async fn load_node(&self, id: Uuid) -> Result<NodeExecution, EngineError> {
        self.store
            .get_node(id)
            .await?
            .ok_or(EngineError::NodeNotFound(id))
    }

    pub(crate) async fn load_run(&self, plan_execution_id: Uuid) -> Result<RunRecord, EngineError> {
        self.store
            .get_run(plan_execution_id)
            .await?
            .ok_or(EngineError::UnknownRun(plan_execution_id))
    }

    /// Plan of a run, cached after the first read
    pub(crate) async fn plan_for(&self, plan_execution_id: Uuid) -> Result<Arc<Plan>, EngineError> {
        if let Some(plan) = self.plans.read().await.get(&plan_execution_id) {
            return Ok(plan.clone());
        }
        let plan = Arc::new(self.load_run(plan_execution_id).await?.plan);
        self.plans
            .write()
            .await
            .insert(plan_execution_id, plan.clone());
        Ok(plan)
    }

    pub(crate) async fn plan_node(&self, node: &NodeExecution) -> Result<(Arc<Plan>, PlanNode), EngineError> {
        let plan = self.plan_for(node.plan_execution_id).await?;
        let plan_node = plan
            .node(&node.plan_node_id)
            .cloned()
            .ok_or_else(|| EngineError::Plan(format!("plan node '{}' not found", node.plan_node_id)))?;
        Ok((plan, plan_node))
    }

    /// Create a QUEUED node under `parent` and publish its start.
    ///
    /// Safe to repeat: the id is chosen by the caller and an existing record
    /// is left as it is.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn queue_node(
        &self,
        parent: &Ambiance,
        plan_node: &PlanNode,
        id: Uuid,
        previous_id: Option<Uuid>,
        retry_ids: Vec<Uuid>,
        delay_secs: u64,
        strategy: Option<StrategyMetadata>,
    ) -> Result<NodeExecution, EngineError> {
        let mut level = Level::new(&plan_node.id, id, &plan_node.identifier, plan_node.kind)
            .with_step_type(&plan_node.step_type)
            .with_retry_index(retry_ids.len() as u32);
        if let Some(strategy) = strategy {
            level = level.with_strategy(strategy);
        }

        let node = NodeExecution::new(
            parent.derive(level),
            &plan_node.id,
            &plan_node.identifier,
            plan_node.kind,
        )
        .with_parameters(plan_node.step_parameters.clone())
        .with_previous(previous_id)
        .with_retry_ids(retry_ids);

        if self.store.insert_node(&node).await? {
            debug!("Queued node {} ({})", node.identifier, node.id);
        }

        let event = NodeStartEvent {
            node_execution_id: node.id,
            ambiance: node.ambiance.clone(),
        };
        self.publish(
            &event,
            Some(format!("start-{}", node.id)),
            Duration::from_secs(delay_secs),
        )
        .await?;
        Ok(node)
    }

    /// Hand a finished node back to its parent, or end the run at the root
    pub(crate) async fn finish_node(&self, node: &NodeExecution) -> Result<(), EngineError> {
        self.modify_node(node.id, |n| {
            if n.concluded {
                return Ok(false);
            }
            n.concluded = true;
            Ok(true)
        })
        .await?;

        match node.parent_id {
            Some(parent_id) => {
                let event = SdkResponseEvent::ChildEnded {
                    parent_id,
                    child_id: node.id,
                };
                self.publish(&event, Some(format!("child-ended-{}", node.id)), Duration::ZERO)
                    .await?;
            }
            None => {
                let (status, failure) = if node.is_absorbed() {
                    (Status::Succeeded, None)
                } else {
                    (node.status, node.failure_info.clone())
                };
                self.complete_run(node.plan_execution_id, status, failure)
                    .await?;
            }
        }
        Ok(())
    }

    /// Give up on a run that cannot make progress: every active node that
    /// may error out is ERRORED and the run ends ERRORED
    pub async fn error_out_run(&self, plan_execution_id: Uuid, reason: &str) -> Result<usize, EngineError> {
        let changed = self
            .store
            .error_out_active_nodes(plan_execution_id)
            .await?;
        warn!(
            "Run {} errored out ({} nodes): {}",
            plan_execution_id, changed, reason
        );
        self.complete_run(
            plan_execution_id,
            Status::Errored,
            Some(FailureInfo::internal(reason)),
        )
        .await?;
        Ok(changed)
    }

    /// Record the terminal status of a run once
    pub(crate) async fn complete_run(
        &self,
        plan_execution_id: Uuid,
        status: Status,
        failure_info: Option<FailureInfo>,
    ) -> Result<(), EngineError> {
        let finished = self
            .modify_run(plan_execution_id, |run| {
                if run.is_finished() {
                    return Ok(false);
                }
                run.finish(status, failure_info.clone());
                Ok(true)
            })
            .await?;

        if let Some(run) = finished {
            info!("Run {} finished: {}", plan_execution_id, run.status);
            self.emit(ExecutionEvent::RunCompleted {
                plan_execution_id,
                status: run.status,
                failure_info: run.failure_info,
            });
        }
        Ok(())
    }
}

/// Deterministic id of a node created by `parent` for `purpose`
pub(crate) fn derive_id(parent: Uuid, purpose: &str) -> Uuid {
    Uuid::new_v5(&parent, purpose.as_bytes())
}
