use serde::{Deserialize, Serialize};

/// Pending-entry counts per priority band.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityCounts {
    /// Pending entries in the `critical` band.
    pub critical: u64,
    /// Pending entries in the `high` band.
    pub high: u64,
    /// Pending entries in the `medium` band.
    pub medium: u64,
    /// Pending entries in the `low` band.
    pub low: u64,
}

/// Read-only aggregate over one agent's task queue rows.
///
/// Derived on demand from the store; never persisted by the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueMetrics {
    /// The agent these metrics were computed for.
    pub agent_id: String,
    /// Entries waiting to be claimed.
    pub pending: u64,
    /// Entries currently owned by the agent.
    pub processing: u64,
    /// Entries finished successfully.
    pub completed: u64,
    /// Entries that exhausted their retries.
    pub failed: u64,
    /// Entries waiting out a retry delay.
    pub retrying: u64,
    /// Pending entries broken down by priority band.
    pub pending_by_priority: PriorityCounts,
    /// Mean `completed_at - started_at` over completed entries, in seconds.
    pub avg_processing_secs: Option<f64>,
}

impl QueueMetrics {
    /// Total entries across all statuses.
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.retrying
    }
}
