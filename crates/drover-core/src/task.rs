use crate::{DroverError, DroverResult, DEFAULT_MAX_RETRIES};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Claim-ordering class for queue entries.
///
/// Higher bands always win: an eligible `Critical` entry is claimed before
/// any `Low` entry regardless of age. Within a band, claims are FIFO by
/// `scheduled_for`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Must run before everything else.
    Critical,
    /// Elevated priority.
    High,
    /// Default priority.
    Medium,
    /// Background work.
    Low,
}

impl Priority {
    /// Claim-ordering rank: lower rank is claimed first.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }

    /// The canonical string form stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Priority {
    type Err = DroverError;

    fn from_str(s: &str) -> DroverResult<Self> {
        match s {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(DroverError::Validation(format!(
                "unknown priority '{other}'"
            ))),
        }
    }
}

/// Lifecycle status of a queue entry.
///
/// `Pending → Processing → {Completed | Retrying | Failed}`; a `Retrying`
/// entry re-enters the claimable pool as `Pending` once its retry delay
/// elapses. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Eligible for claiming once `scheduled_for` has passed.
    Pending,
    /// Claimed and owned by exactly one agent.
    Processing,
    /// Finished successfully. Terminal.
    Completed,
    /// Exhausted its retries. Terminal.
    Failed,
    /// Failed with retries remaining; waiting out the backoff delay.
    Retrying,
}

impl TaskStatus {
    /// The canonical string form stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
        }
    }

    /// Whether no further transition out of this status is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DroverError;

    fn from_str(s: &str) -> DroverResult<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "retrying" => Ok(TaskStatus::Retrying),
            other => Err(DroverError::Validation(format!(
                "unknown task status '{other}'"
            ))),
        }
    }
}

/// An atomic work item in the shared task queue.
///
/// `payload` and `metadata` are opaque to the control plane: the core
/// coordinates their lifecycle but never interprets their shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueueEntry {
    /// Unique identifier.
    pub id: Uuid,
    /// Target agent or agent-class before the claim; the owning agent after.
    pub agent_id: Option<String>,
    /// Which kind of work this is — matched against a claimer's accepted types.
    pub task_type: String,
    /// Claim-ordering band.
    pub priority: Priority,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Opaque work payload.
    pub payload: serde_json::Value,
    /// Opaque metadata; completion results are merged in here.
    pub metadata: serde_json::Value,
    /// Automatic retries consumed so far. Never exceeds `max_retries`.
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

/// Parameters for enqueueing a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    /// Optional target agent or agent-class.
    pub agent_id: Option<String>,
    /// Which kind of work this is. Must be non-empty.
    pub task_type: String,
    /// Claim-ordering band.
    pub priority: Priority,
    /// Opaque work payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Opaque metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Automatic retry budget.
    pub max_retries: u32,
    /// Earliest claim time; defaults to now at enqueue.
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl NewTask {
    /// Creates an enqueue request with default retry budget and empty payload.
    pub fn new(task_type: impl Into<String>, priority: Priority) -> Self {
        Self {
            agent_id: None,
            task_type: task_type.into(),
            priority,
            payload: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
            max_retries: DEFAULT_MAX_RETRIES,
            scheduled_for: None,
        }
    }

    /// Targets a specific agent or agent-class.
    pub fn with_target(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Attaches the opaque work payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
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

impl TaskQueueEntry {
    /// Builds a fresh `Pending` entry from an enqueue request.
    pub fn from_request(request: NewTask) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_id: request.agent_id,
            task_type: request.task_type,
            priority: request.priority,
            status: TaskStatus::Pending,
            payload: request.payload,
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

/// Merges a completion result into an entry's opaque metadata.
///
/// Object-into-object merges key-by-key (result keys win); any other shape
/// is stored under a `result` key so nothing is silently dropped.
pub fn merge_result(metadata: &serde_json::Value, result: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match (metadata, result) {
        (Value::Object(base), Value::Object(extra)) => {
            let mut merged = base.clone();
            for (key, value) in extra {
                merged.insert(key, value);
            }
            Value::Object(merged)
        }
        (Value::Null, result @ Value::Object(_)) => result,
        (Value::Null, other) => serde_json::json!({ "result": other }),
        (base, other) => {
            let mut merged = serde_json::Map::new();
            if let Value::Object(map) = base {
                merged.extend(map.clone());
            } else {
                merged.insert("previous".to_string(), base.clone());
            }
            merged.insert("result".to_string(), other);
            Value::Object(merged)
        }
    }
}
