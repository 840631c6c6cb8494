use drover_core::{
    DroverError, DroverResult, NewTask, NewWorkflow, QueueMetrics, RetryPolicy, TaskQueueEntry,
    WorkflowQueueEntry,
};
use drover_store::QueueStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Owns the task and workflow lifecycle over the shared store.
///
/// Claiming is delegated to the store's atomic claim primitive; the manager
/// never reads and then writes a claim from the application tier. A claim
/// miss is a normal `Ok(None)`, not an error.
pub struct QueueManager {
    store: Arc<dyn QueueStore>,
    retry: RetryPolicy,
}

impl QueueManager {
    /// Creates a manager using the given retry backoff policy.
    pub fn new(store: Arc<dyn QueueStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Validates and enqueues a task, returning its id.
    pub async fn enqueue_task(&self, request: NewTask) -> DroverResult<Uuid> {
        if request.task_type.trim().is_empty() {
            return Err(DroverError::Validation(
                "task_type must not be empty".to_string(),
            ));
        }
        let entry = TaskQueueEntry::from_request(request);
        self.store.insert_task(&entry).await?;
        info!(task_id = %entry.id, task_type = %entry.task_type, priority = %entry.priority, "task enqueued");
        Ok(entry.id)
    }

    /// Atomically claims the best eligible task for `agent_id`, or `None`.
    ///
    /// Priority bands dominate; within a band claims are FIFO by
    /// `scheduled_for`.
    pub async fn claim_next_task(
        &self,
        agent_id: &str,
        accepted_types: &[String],
    ) -> DroverResult<Option<TaskQueueEntry>> {
        self.store.claim_next_task(agent_id, accepted_types).await
    }

    /// Completes a processing task owned by `agent_id`, merging `result`
    /// into its metadata.
    ///
    /// Fails with `NotFound` when the task is missing, already terminal, or
    /// owned by someone else — the message names the observed state so the
    /// caller can decide whether to discard its result or alert an operator.
    pub async fn complete_task(
        &self,
        agent_id: &str,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> DroverResult<TaskQueueEntry> {
        let entry = self.store.complete_task(agent_id, task_id, result).await?;
        info!(task_id = %task_id, agent_id, "task completed");
        Ok(entry)
    }

    /// Records a task failure, scheduling a retry while the budget lasts.
    pub async fn fail_task(
        &self,
        agent_id: &str,
        task_id: Uuid,
        error: &str,
    ) -> DroverResult<TaskQueueEntry> {
        let entry = self
            .store
            .fail_task(agent_id, task_id, error, &self.retry)
            .await?;
        warn!(
            task_id = %task_id,
            agent_id,
            status = %entry.status,
            retry_count = entry.retry_count,
            error,
            "task failed"
        );
        Ok(entry)
    }

    /// Fetches a task entry by id.
    pub async fn get_task(&self, task_id: Uuid) -> DroverResult<Option<TaskQueueEntry>> {
        self.store.get_task(task_id).await
    }

    /// Validates and enqueues a workflow, returning its id.
    pub async fn enqueue_workflow(&self, request: NewWorkflow) -> DroverResult<Uuid> {
        if request.workflow_type.trim().is_empty() {
            return Err(DroverError::Validation(
                "workflow_type must not be empty".to_string(),
            ));
        }
        let entry = WorkflowQueueEntry::from_request(request);
        self.store.insert_workflow(&entry).await?;
        info!(workflow_id = %entry.id, workflow_type = %entry.workflow_type, "workflow enqueued");
        Ok(entry.id)
    }

    /// Workflow mirror of [`QueueManager::claim_next_task`].
    pub async fn claim_next_workflow(
        &self,
        orchestrator_id: &str,
        accepted_types: &[String],
    ) -> DroverResult<Option<WorkflowQueueEntry>> {
        self.store
            .claim_next_workflow(orchestrator_id, accepted_types)
            .await
    }

    /// Workflow mirror of [`QueueManager::complete_task`].
    pub async fn complete_workflow(
        &self,
        orchestrator_id: &str,
        workflow_id: Uuid,
        result: serde_json::Value,
    ) -> DroverResult<WorkflowQueueEntry> {
        let entry = self
            .store
            .complete_workflow(orchestrator_id, workflow_id, result)
            .await?;
        info!(workflow_id = %workflow_id, orchestrator_id, "workflow completed");
        Ok(entry)
    }

    /// Workflow mirror of [`QueueManager::fail_task`].
    pub async fn fail_workflow(
        &self,
        orchestrator_id: &str,
        workflow_id: Uuid,
        error: &str,
    ) -> DroverResult<WorkflowQueueEntry> {
        let entry = self
            .store
            .fail_workflow(orchestrator_id, workflow_id, error, &self.retry)
            .await?;
        warn!(
            workflow_id = %workflow_id,
            orchestrator_id,
            status = %entry.status,
            error,
            "workflow failed"
        );
        Ok(entry)
    }

    /// Fetches a workflow entry by id.
    pub async fn get_workflow(&self, workflow_id: Uuid) -> DroverResult<Option<WorkflowQueueEntry>> {
        self.store.get_workflow(workflow_id).await
    }

    /// Read-only aggregation over one agent's task rows. Never blocks writers.
    pub async fn get_queue_metrics(&self, agent_id: &str) -> DroverResult<QueueMetrics> {
        self.store.queue_metrics(agent_id).await
    }

    /// Operator sweep: re-queues terminally failed tasks younger than
    /// `max_age`, up to `batch_size` at a time. Distinct from the automatic
    /// per-task retry.
    pub async fn retry_failed_tasks(
        &self,
        max_age: Duration,
        batch_size: u32,
    ) -> DroverResult<u64> {
        let requeued = self.store.retry_failed_tasks(max_age, batch_size).await?;
        if requeued > 0 {
            info!(requeued, "re-queued failed tasks");
        }
        Ok(requeued)
    }

    /// Operator sweep: purges completed tasks older than `max_age` to bound
    /// storage growth.
    pub async fn cleanup_completed_tasks(
        &self,
        max_age: Duration,
        batch_size: u32,
    ) -> DroverResult<u64> {
        let deleted = self
            .store
            .cleanup_completed_tasks(max_age, batch_size)
            .await?;
        if deleted > 0 {
            info!(deleted, "purged completed tasks");
        }
        Ok(deleted)
    }

    /// Operator sweep: re-queues processing tasks whose owner has gone
    /// silent for longer than `liveness_timeout + grace`.
    pub async fn reclaim_stuck_tasks(
        &self,
        liveness_timeout: Duration,
        grace: Duration,
        batch_size: u32,
    ) -> DroverResult<u64> {
        let reclaimed = self
            .store
            .reclaim_stuck_tasks(liveness_timeout, grace, batch_size)
            .await?;
        if reclaimed > 0 {
            warn!(reclaimed, "reclaimed tasks from inactive agents");
        }
        Ok(reclaimed)
    }
}
