use crate::config::ControlPlaneConfig;
use drover_commands::{CommandChannel, CommandHandler};
use drover_core::{
    Agent, AgentDeclaration, AgentStatus, CommandKind, CommandStatus, DroverResult, NewTask,
    NewWorkflow, QueueMetrics, TaskQueueEntry, WorkflowQueueEntry,
};
use drover_queue::QueueManager;
use drover_registry::{AgentRegistry, MetricsSupplier};
use drover_store::{
    ChangeEvent, CommandStore, QueueStore, RegistryStore, SqliteStore, Topic,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

/// The composed control-plane client.
///
/// One instance per process is typical, but nothing is global: each instance
/// owns its own store handle, heartbeat timers, and subscriptions, so
/// several can coexist (tests rely on this). [`ControlPlane::cleanup`] tears
/// all of it down for a graceful shutdown.
pub struct ControlPlane {
    store: Arc<SqliteStore>,
    registry: AgentRegistry,
    queue: QueueManager,
    commands: CommandChannel,
    config: ControlPlaneConfig,
}

impl ControlPlane {
    /// Opens the store named by the configuration and wires up all
    /// components.
    pub fn open(config: ControlPlaneConfig) -> DroverResult<Self> {
        let store = match &config.store_path {
            Some(path) => SqliteStore::open(path)?,
            None => SqliteStore::open_in_memory()?,
        }
        .with_feed_capacity(config.feed_capacity);
        Ok(Self::with_store(Arc::new(store), config))
    }

    /// Wires up all components over an already-open store.
    pub fn with_store(store: Arc<SqliteStore>, config: ControlPlaneConfig) -> Self {
        let registry_store: Arc<dyn RegistryStore> = store.clone();
        let queue_store: Arc<dyn QueueStore> = store.clone();
        let command_store: Arc<dyn CommandStore> = store.clone();
        let registry = AgentRegistry::new(registry_store);
        let queue = QueueManager::new(queue_store, config.retry.clone());
        let commands = CommandChannel::new(command_store, store.feed());
        info!(
            heartbeat_interval_secs = config.heartbeat_interval_secs,
            liveness_timeout_secs = config.liveness_timeout_secs,
            "control plane ready"
        );
        Self {
            store,
            registry,
            queue,
            commands,
            config,
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    // --- Agent registry ---

    /// Registers a new agent and returns its id.
    pub async fn register(&self, declaration: AgentDeclaration) -> DroverResult<String> {
        self.registry.register(declaration).await
    }

    /// Terminates an agent. Idempotent.
    pub async fn unregister(&self, agent_id: &str) -> DroverResult<()> {
        self.registry.unregister(agent_id).await
    }

    /// Applies an agent status change.
    pub async fn update_status(&self, agent_id: &str, status: AgentStatus) -> DroverResult<()> {
        self.registry.update_status(agent_id, status).await
    }

    /// Fetches an agent by id.
    pub async fn get_agent(&self, agent_id: &str) -> DroverResult<Option<Agent>> {
        self.registry.get(agent_id).await
    }

    /// Starts heartbeating for an agent at the configured interval.
    pub fn start_heartbeat(&self, agent_id: &str, supplier: Arc<dyn MetricsSupplier>) {
        self.registry
            .start_heartbeat(agent_id, supplier, self.config.heartbeat_interval());
    }

    /// Starts heartbeating at a caller-supplied interval.
    pub fn start_heartbeat_with_interval(
        &self,
        agent_id: &str,
        supplier: Arc<dyn MetricsSupplier>,
        interval: Duration,
    ) {
        self.registry.start_heartbeat(agent_id, supplier, interval);
    }

    /// Stops an agent's heartbeat timer. Safe when none is running.
    pub async fn stop_heartbeat(&self, agent_id: &str) {
        self.registry.stop_heartbeat(agent_id).await;
    }

    /// All live agents, judged against the configured liveness timeout.
    pub async fn list_active(&self) -> DroverResult<Vec<Agent>> {
        self.registry
            .list_active(self.config.liveness_timeout())
            .await
    }

    /// All live agents within a caller-supplied liveness window.
    pub async fn list_active_within(&self, timeout: Duration) -> DroverResult<Vec<Agent>> {
        self.registry.list_active(timeout).await
    }

    // --- Queue manager ---

    /// Enqueues a task.
    pub async fn enqueue_task(&self, request: NewTask) -> DroverResult<Uuid> {
        self.queue.enqueue_task(request).await
    }

    /// Claims the next eligible task for an agent.
    pub async fn claim_next_task(
        &self,
        agent_id: &str,
        accepted_types: &[String],
    ) -> DroverResult<Option<TaskQueueEntry>> {
        self.queue.claim_next_task(agent_id, accepted_types).await
    }

    /// Completes a claimed task.
    pub async fn complete_task(
        &self,
        agent_id: &str,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> DroverResult<TaskQueueEntry> {
        self.queue.complete_task(agent_id, task_id, result).await
    }

    /// Fails a claimed task, scheduling a retry while the budget lasts.
    pub async fn fail_task(
        &self,
        agent_id: &str,
        task_id: Uuid,
        error: &str,
    ) -> DroverResult<TaskQueueEntry> {
        self.queue.fail_task(agent_id, task_id, error).await
    }

    /// Fetches a task entry.
    pub async fn get_task(&self, task_id: Uuid) -> DroverResult<Option<TaskQueueEntry>> {
        self.queue.get_task(task_id).await
    }

    /// Enqueues a workflow.
    pub async fn enqueue_workflow(&self, request: NewWorkflow) -> DroverResult<Uuid> {
        self.queue.enqueue_workflow(request).await
    }

    /// Claims the next eligible workflow for an orchestrator.
    pub async fn claim_next_workflow(
        &self,
        orchestrator_id: &str,
        accepted_types: &[String],
    ) -> DroverResult<Option<WorkflowQueueEntry>> {
        self.queue
            .claim_next_workflow(orchestrator_id, accepted_types)
            .await
    }

    /// Completes a claimed workflow.
    pub async fn complete_workflow(
        &self,
        orchestrator_id: &str,
        workflow_id: Uuid,
        result: serde_json::Value,
    ) -> DroverResult<WorkflowQueueEntry> {
        self.queue
            .complete_workflow(orchestrator_id, workflow_id, result)
            .await
    }

    /// Fails a claimed workflow.
    pub async fn fail_workflow(
        &self,
        orchestrator_id: &str,
        workflow_id: Uuid,
        error: &str,
    ) -> DroverResult<WorkflowQueueEntry> {
        self.queue
            .fail_workflow(orchestrator_id, workflow_id, error)
            .await
    }

    /// Fetches a workflow entry.
    pub async fn get_workflow(&self, workflow_id: Uuid) -> DroverResult<Option<WorkflowQueueEntry>> {
        self.queue.get_workflow(workflow_id).await
    }

    /// Per-agent queue metrics.
    pub async fn get_queue_metrics(&self, agent_id: &str) -> DroverResult<QueueMetrics> {
        self.queue.get_queue_metrics(agent_id).await
    }

    /// Operator sweep: re-queue recent terminal failures.
    pub async fn retry_failed_tasks(
        &self,
        max_age: Duration,
        batch_size: u32,
    ) -> DroverResult<u64> {
        self.queue.retry_failed_tasks(max_age, batch_size).await
    }

    /// Operator sweep: purge old completed tasks.
    pub async fn cleanup_completed_tasks(
        &self,
        max_age: Duration,
        batch_size: u32,
    ) -> DroverResult<u64> {
        self.queue
            .cleanup_completed_tasks(max_age, batch_size)
            .await
    }

    /// Operator sweep: re-queue processing tasks held by agents that have
    /// gone silent for the configured liveness timeout plus `grace`.
    pub async fn reclaim_stuck_tasks(&self, grace: Duration, batch_size: u32) -> DroverResult<u64> {
        self.queue
            .reclaim_stuck_tasks(self.config.liveness_timeout(), grace, batch_size)
            .await
    }

    // --- Command channel ---

    /// Sends a control command to an agent.
    pub async fn send_command(
        &self,
        agent_id: &str,
        command: CommandKind,
        parameters: serde_json::Value,
    ) -> DroverResult<Uuid> {
        self.commands
            .send_command(agent_id, command, parameters)
            .await
    }

    /// Starts consuming commands for an agent.
    pub fn subscribe_commands(&self, agent_id: &str, handler: Arc<dyn CommandHandler>) {
        self.commands.subscribe_commands(agent_id, handler);
    }

    /// Fetches a command by id.
    pub async fn get_command(
        &self,
        command_id: Uuid,
    ) -> DroverResult<Option<drover_core::ControlCommand>> {
        self.commands.get_command(command_id).await
    }

    /// Writes back a command outcome.
    pub async fn update_command_status(
        &self,
        command_id: Uuid,
        status: CommandStatus,
        error: Option<&str>,
    ) -> DroverResult<()> {
        self.commands
            .update_command_status(command_id, status, error)
            .await
    }

    // --- Change notifications ---

    /// Live task changes for an agent. Used by dashboards and by agents
    /// watching items they do not own. Delivery is at-least-once.
    pub fn subscribe_task_updates(&self, agent_id: &str) -> broadcast::Receiver<ChangeEvent> {
        self.store.feed().subscribe(&Topic::tasks(agent_id))
    }

    /// Live workflow changes for an orchestrator.
    pub fn subscribe_workflow_updates(
        &self,
        orchestrator_id: &str,
    ) -> broadcast::Receiver<ChangeEvent> {
        self.store.feed().subscribe(&Topic::workflows(orchestrator_id))
    }

    // --- Lifecycle ---

    /// Stops every heartbeat timer and command subscription.
    pub async fn cleanup(&self) {
        self.registry.stop_all_heartbeats().await;
        self.commands.shutdown();
        info!("control plane shut down");
    }
}
