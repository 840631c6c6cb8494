use crate::task::{Priority, TaskStatus};
use crate::DEFAULT_MAX_RETRIES;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A multi-step job in the workflow queue.
///
/// Mirrors [`crate::TaskQueueEntry`] but is owned by an orchestrator rather
/// than a job agent, and carries a workflow document (ordered steps plus an
/// optional error-handling policy) and the opaque sub-task descriptors the
/// orchestrator has created. Sub-tasks are not separately scheduled by the
/// control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowQueueEntry {
    /// Unique identifier.
    pub id: Uuid,
    /// Target orchestrator or orchestrator-class before the claim; the
    /// owning orchestrator after.
    pub orchestrator_id: Option<String>,
    /// Which kind of workflow this is — matched against a claimer's accepted types.
    pub workflow_type: String,
    /// Claim-ordering band.
    pub priority: Priority,
    /// Current lifecycle status. Shares the task state machine.
    pub status: TaskStatus,
    /// Opaque workflow document: ordered steps, optional error policy.
    pub workflow: serde_json::Value,
    /// Opaque sub-task descriptors created by the orchestrator.
    pub sub_tasks: Vec<serde_json::Value>,
    /// Opaque metadata; completion results are merged in here.
    pub metadata: serde_json::Value,
    /// Automatic retries consumed so far.
    pub retry_count: u32,
    /// Automatic retry budget.
    pub max_retries: u32,
    /// Earliest time a claim may succeed.
    pub scheduled_for: DateTime<Utc>,
    /// When the current owner claimed the entry.
    pub started_at: Option<DateTime<Utc>>,
    /// When the entry reached `Completed`.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last failure message, if any.
    pub error: Option<String>,
    /// When the entry was enqueued.
    pub created_at: DateTime<Utc>,
    /// Refreshed on every state change.
    pub updated_at: DateTime<Utc>,
}

/// Parameters for enqueueing a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkflow {
    /// Optional target orchestrator or orchestrator-class.
    pub orchestrator_id: Option<String>,
    /// Which kind of workflow this is. Must be non-empty.
    pub workflow_type: String,
    /// Claim-ordering band.
    pub priority: Priority,
    /// Opaque workflow document.
    #[serde(default)]
    pub workflow: serde_json::Value,
    /// Opaque sub-task descriptors.
    #[serde(default)]
    pub sub_tasks: Vec<serde_json::Value>,
    /// Opaque metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Automatic retry budget.
    pub max_retries: u32,
    /// Earliest claim time; defaults to now at enqueue.
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl NewWorkflow {
    /// Creates an enqueue request with default retry budget.
    pub fn new(workflow_type: impl Into<String>, priority: Priority) -> Self {
        Self {
            orchestrator_id: None,
            workflow_type: workflow_type.into(),
            priority,
            workflow: serde_json::Value::Null,
            sub_tasks: Vec::new(),
            metadata: serde_json::Value::Null,
            max_retries: DEFAULT_MAX_RETRIES,
            scheduled_for: None,
        }
    }

    /// Targets a specific orchestrator or orchestrator-class.
    pub fn with_target(mut self, orchestrator_id: impl Into<String>) -> Self {
        self.orchestrator_id = Some(orchestrator_id.into());
        self
    }

    /// Attaches the opaque workflow document.
    pub fn with_workflow(mut self, workflow: serde_json::Value) -> Self {
        self.workflow = workflow;
        self
    }

    /// Attaches opaque sub-task descriptors.
    pub fn with_sub_tasks(mut self, sub_tasks: Vec<serde_json::Value>) -> Self {
        self.sub_tasks = sub_tasks;
        self
    }

    /// Attaches opaque metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Overrides the automatic retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Defers the earliest claim time.
    pub fn scheduled_at(mut self, when: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(when);
        self
    }
}

impl WorkflowQueueEntry {
    /// Builds a fresh `Pending` entry from an enqueue request.
    pub fn from_request(request: NewWorkflow) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            orchestrator_id: request.orchestrator_id,
            workflow_type: request.workflow_type,
            priority: request.priority,
            status: TaskStatus::Pending,
            workflow: request.workflow,
            sub_tasks: request.sub_tasks,
            metadata: request.metadata,
            retry_count: 0,
            max_retries: request.max_retries,
            scheduled_for: request.scheduled_for.unwrap_or(now),
            started_at: None,
            completed_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_workflow_from_request() {
        let request = NewWorkflow::new("prospect-scoring", Priority::High)
            .with_target("orchestrator-1")
            .with_workflow(json!({"steps": [{"op": "fetch"}, {"op": "score"}]}))
            .with_sub_tasks(vec![json!({"type": "fetch"})]);
        let entry = WorkflowQueueEntry::from_request(request);
        assert_eq!(entry.status, TaskStatus::Pending);
        assert_eq!(entry.orchestrator_id.as_deref(), Some("orchestrator-1"));
        assert_eq!(entry.sub_tasks.len(), 1);
        assert_eq!(entry.max_retries, DEFAULT_MAX_RETRIES);
    }
}
