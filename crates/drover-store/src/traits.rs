use async_trait::async_trait;
use drover_core::{
    Agent, AgentStatus, CommandStatus, ControlCommand, DroverResult, Heartbeat, QueueMetrics,
    RetryPolicy, TaskQueueEntry, WorkflowQueueEntry,
};
use std::time::Duration;
use uuid::Uuid;

/// Agent identity and liveness persistence.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Inserts a freshly registered agent row.
    async fn insert_agent(&self, agent: &Agent) -> DroverResult<()>;

    /// Fetches an agent by id.
    async fn get_agent(&self, agent_id: &str) -> DroverResult<Option<Agent>>;

    /// Applies a status change, refreshing `updated_at`.
    ///
    /// `Terminated` is absorbing: re-terminating is a no-op success, any
    /// other transition out of it fails with `InvalidTransition`.
    async fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> DroverResult<()>;

    /// Appends a liveness sample and refreshes the agent's `updated_at`.
    async fn append_heartbeat(&self, heartbeat: &Heartbeat) -> DroverResult<()>;

    /// The most recent heartbeat for an agent, if any.
    async fn latest_heartbeat(&self, agent_id: &str) -> DroverResult<Option<Heartbeat>>;

    /// All non-terminated agents whose newest heartbeat is younger than `timeout`.
    async fn list_active_agents(&self, timeout: Duration) -> DroverResult<Vec<Agent>>;
}

/// Task and workflow queue persistence.
///
/// The claim operations are the concurrency-critical surface: they must be
/// executed as one atomic conditional update inside the store, never as a
/// read-then-write from the application tier.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Inserts a pending task entry.
    async fn insert_task(&self, entry: &TaskQueueEntry) -> DroverResult<()>;

    /// Fetches a task entry by id.
    async fn get_task(&self, task_id: Uuid) -> DroverResult<Option<TaskQueueEntry>>;

    /// Atomically claims the single best eligible task for `agent_id`.
    ///
    /// Eligibility: `status = pending`, `scheduled_for <= now`, and
    /// `task_type` among `accepted_types`. Best: lowest priority rank first,
    /// then oldest `scheduled_for`. Returns `None` when nothing is eligible —
    /// that is a normal result, not an error. Two concurrent callers can
    /// never claim the same row.
    async fn claim_next_task(
        &self,
        agent_id: &str,
        accepted_types: &[String],
    ) -> DroverResult<Option<TaskQueueEntry>>;

    /// Marks a processing task owned by `agent_id` as completed, merging
    /// `result` into its metadata.
    async fn complete_task(
        &self,
        agent_id: &str,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> DroverResult<TaskQueueEntry>;

    /// Records a failure: schedules a retry while the budget lasts,
    /// otherwise marks the task terminally failed.
    async fn fail_task(
        &self,
        agent_id: &str,
        task_id: Uuid,
        error: &str,
        retry: &RetryPolicy,
    ) -> DroverResult<TaskQueueEntry>;

    /// Inserts a pending workflow entry.
    async fn insert_workflow(&self, entry: &WorkflowQueueEntry) -> DroverResult<()>;

    /// Fetches a workflow entry by id.
    async fn get_workflow(&self, workflow_id: Uuid) -> DroverResult<Option<WorkflowQueueEntry>>;

    /// Workflow mirror of [`QueueStore::claim_next_task`].
    async fn claim_next_workflow(
        &self,
        orchestrator_id: &str,
        accepted_types: &[String],
    ) -> DroverResult<Option<WorkflowQueueEntry>>;

    /// Workflow mirror of [`QueueStore::complete_task`].
    async fn complete_workflow(
        &self,
        orchestrator_id: &str,
        workflow_id: Uuid,
        result: serde_json::Value,
    ) -> DroverResult<WorkflowQueueEntry>;

    /// Workflow mirror of [`QueueStore::fail_task`].
    async fn fail_workflow(
        &self,
        orchestrator_id: &str,
        workflow_id: Uuid,
        error: &str,
        retry: &RetryPolicy,
    ) -> DroverResult<WorkflowQueueEntry>;

    /// Read-only aggregation over one agent's task rows.
    async fn queue_metrics(&self, agent_id: &str) -> DroverResult<QueueMetrics>;

    /// Re-queues terminally failed tasks younger than `max_age`, up to
    /// `batch_size` at a time. Returns how many were re-queued.
    async fn retry_failed_tasks(&self, max_age: Duration, batch_size: u32) -> DroverResult<u64>;

    /// Purges completed tasks older than `max_age`, up to `batch_size` at a
    /// time. Returns how many rows were deleted.
    async fn cleanup_completed_tasks(&self, max_age: Duration, batch_size: u32)
        -> DroverResult<u64>;

    /// Re-queues processing tasks whose owner has produced no heartbeat
    /// within `liveness_timeout + grace`. Returns how many were re-queued.
    async fn reclaim_stuck_tasks(
        &self,
        liveness_timeout: Duration,
        grace: Duration,
        batch_size: u32,
    ) -> DroverResult<u64>;
}

/// Control command persistence.
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Inserts a pending command and notifies the target agent's topic.
    async fn insert_command(&self, command: &ControlCommand) -> DroverResult<()>;

    /// Fetches a command by id.
    async fn get_command(&self, command_id: Uuid) -> DroverResult<Option<ControlCommand>>;

    /// All still-pending commands for an agent, oldest first.
    async fn pending_commands(&self, agent_id: &str) -> DroverResult<Vec<ControlCommand>>;

    /// Writes back a command outcome. Duplicate terminal writes are accepted
    /// (idempotent); exactly-once consumption is the caller's concern.
    async fn set_command_status(
        &self,
        command_id: Uuid,
        status: CommandStatus,
        error: Option<&str>,
    ) -> DroverResult<()>;
}
