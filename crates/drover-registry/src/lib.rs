//! Agent registration and liveness for the Drover control plane.
//!
//! Agents register once, heartbeat periodically, and are logically deleted by
//! termination — never physically removed. Liveness is derived from the
//! newest heartbeat, so a crashed agent simply ages out of
//! [`AgentRegistry::list_active`].
//!
//! # Main types
//!
//! - [`AgentRegistry`] — Registration, status transitions, and liveness queries.
//! - [`HeartbeatHandle`] — A running per-agent heartbeat timer.
//! - [`MetricsSupplier`] — Callback producing the metrics embedded in each sample.

/// Per-agent heartbeat timer with buffered publishing.
pub mod heartbeat;
/// The agent registry.
pub mod registry;

pub use heartbeat::{HeartbeatHandle, MetricsSupplier};
pub use registry::AgentRegistry;
