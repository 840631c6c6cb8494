//! Core types and error definitions for the Drover control plane.
//!
//! This crate provides the foundational types shared across all Drover crates:
//! the error taxonomy, agent and heartbeat records, task and workflow queue
//! entries, control commands, and the retry backoff policy.
//!
//! # Main types
//!
//! - [`DroverError`] — Unified error enum for all control-plane subsystems.
//! - [`DroverResult`] — Convenience alias for `Result<T, DroverError>`.
//! - [`Agent`] / [`Heartbeat`] — Identity and liveness records for worker processes.
//! - [`TaskQueueEntry`] / [`WorkflowQueueEntry`] — Atomic work items in the shared queues.
//! - [`ControlCommand`] — One-shot instructions pushed to a specific agent.
//! - [`RetryPolicy`] — Exponential backoff with jitter for failed tasks.

/// Agent identity, status, and heartbeat records.
pub mod agent;
/// Control commands pushed from a controller to agents.
pub mod command;
/// Derived queue metrics aggregates.
pub mod metrics;
/// Retry backoff policy for failed queue entries.
pub mod retry;
/// Task queue entries and priorities.
pub mod task;
/// Workflow queue entries.
pub mod workflow;

pub use agent::{Agent, AgentDeclaration, AgentKind, AgentStatus, Heartbeat, HeartbeatMetrics};
pub use command::{CommandKind, CommandStatus, ControlCommand};
pub use metrics::{PriorityCounts, QueueMetrics};
pub use retry::RetryPolicy;
pub use task::{merge_result, NewTask, Priority, TaskQueueEntry, TaskStatus};
pub use workflow::{NewWorkflow, WorkflowQueueEntry};

use std::time::Duration;

/// Default interval between heartbeat samples.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default window after which an agent without heartbeats is considered dead.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(90);

/// Default number of automatic retries for a failed queue entry.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Top-level error type for the Drover control plane.
///
/// Claim misses are deliberately *not* part of this taxonomy: an empty queue
/// is a normal `Ok(None)` result, and claim conflicts are resolved inside the
/// store's atomic claim primitive.
#[derive(Debug, thiserror::Error)]
pub enum DroverError {
    /// Malformed registration or enqueue input, rejected before any write.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The target entity does not exist, or is no longer in the state the
    /// operation requires (e.g. a task already completed or reassigned).
    /// The message carries the observed state so callers can tell the two
    /// cases apart.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An illegal status change, e.g. resurrecting a terminated agent.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// A failure in the underlying persistent store. Whether it is transient
    /// or permanent is store-specific and left to the caller to classify.
    #[error("Store error: {0}")]
    Store(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`DroverError`].
pub type DroverResult<T> = Result<T, DroverError>;
