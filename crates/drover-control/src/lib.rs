//! The Drover control plane facade.
//!
//! Composes the agent registry, the queue manager, and the command channel
//! over one shared store into the single client object agent processes and
//! dashboards talk to. The facade holds no state of its own — it is pure
//! delegation plus lifecycle wiring: [`ControlPlane::cleanup`] stops every
//! heartbeat timer and command subscription for a graceful shutdown.
//!
//! # Main types
//!
//! - [`ControlPlane`] — The composed client API.
//! - [`ControlPlaneConfig`] — TOML-loadable configuration with serde defaults.

/// Control-plane configuration.
pub mod config;
/// The composed facade.
pub mod plane;

pub use config::ControlPlaneConfig;
pub use plane::ControlPlane;

pub use drover_commands::CommandHandler;
pub use drover_core::{
    Agent, AgentDeclaration, AgentKind, AgentStatus, CommandKind, CommandStatus, ControlCommand,
    DroverError, DroverResult, Heartbeat, HeartbeatMetrics, NewTask, NewWorkflow, Priority,
    QueueMetrics, RetryPolicy, TaskQueueEntry, TaskStatus, WorkflowQueueEntry,
};
pub use drover_registry::MetricsSupplier;
pub use drover_store::{ChangeEvent, Topic};
