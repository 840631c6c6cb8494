use crate::{DroverError, DroverResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// The role an agent plays in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// An orchestrator-class agent that manages workflows and sub-tasks.
    Strategic,
    /// A worker agent that claims and executes individual tasks.
    Job,
}

impl AgentKind {
    /// The canonical string form stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Strategic => "strategic",
            AgentKind::Job => "job",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = DroverError;

    fn from_str(s: &str) -> DroverResult<Self> {
        match s {
            "strategic" => Ok(AgentKind::Strategic),
            "job" => Ok(AgentKind::Job),
            other => Err(DroverError::Validation(format!(
                "unknown agent kind '{other}'"
            ))),
        }
    }
}

/// Lifecycle status of a registered agent.
///
/// `Terminated` is absorbing: once an agent is terminated no further
/// transition out of it is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Registered and waiting for work.
    Idle,
    /// Actively executing a task or workflow.
    Running,
    /// The agent reported an unrecoverable internal error.
    Error,
    /// Logically deleted. Terminal.
    Terminated,
}

impl AgentStatus {
    /// The canonical string form stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Running => "running",
            AgentStatus::Error => "error",
            AgentStatus::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = DroverError;

    fn from_str(s: &str) -> DroverResult<Self> {
        match s {
            "idle" => Ok(AgentStatus::Idle),
            "running" => Ok(AgentStatus::Running),
            "error" => Ok(AgentStatus::Error),
            "terminated" => Ok(AgentStatus::Terminated),
            other => Err(DroverError::Validation(format!(
                "unknown agent status '{other}'"
            ))),
        }
    }
}

/// Identity and liveness record for a worker process.
///
/// The agent row is owned by the store; in-process components never hold the
/// canonical copy. Rows are never physically deleted — unregistering an agent
/// transitions it to [`AgentStatus::Terminated`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique identifier, minted at registration.
    pub id: String,
    /// The role this agent plays.
    pub kind: AgentKind,
    /// Current lifecycle status.
    pub status: AgentStatus,
    /// Which task/workflow types this agent can serve.
    pub capability_tag: String,
    /// Opaque configuration blob, interpreted only by the agent process.
    pub config: serde_json::Value,
    /// Opaque metadata, including resource declarations.
    pub metadata: serde_json::Value,
    /// When the agent registered.
    pub created_at: DateTime<Utc>,
    /// Refreshed on every status change and heartbeat.
    pub updated_at: DateTime<Utc>,
}

/// What an agent process submits when registering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDeclaration {
    /// The role the agent will play.
    pub kind: AgentKind,
    /// Which task/workflow types the agent can serve. Must be non-empty.
    pub capability_tag: String,
    /// Opaque configuration blob.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Opaque metadata, including resource declarations.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AgentDeclaration {
    /// Creates a declaration with empty config and metadata.
    pub fn new(kind: AgentKind, capability_tag: impl Into<String>) -> Self {
        Self {
            kind,
            capability_tag: capability_tag.into(),
            config: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
        }
    }

    /// Attaches an opaque configuration blob.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Attaches opaque metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

impl Agent {
    /// Builds a fresh agent row from a registration declaration.
    pub fn from_declaration(declaration: AgentDeclaration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            kind: declaration.kind,
            status: AgentStatus::Idle,
            capability_tag: declaration.capability_tag,
            config: declaration.config,
            metadata: declaration.metadata,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Resource and activity metrics embedded in a heartbeat sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMetrics {
    /// CPU utilisation, 0.0–1.0.
    pub cpu: f64,
    /// Memory utilisation, 0.0–1.0.
    pub memory: f64,
    /// Number of jobs the agent currently holds.
    pub active_jobs: u32,
    /// Errors observed since the previous sample.
    pub error_count: u32,
    /// Rolling average task response time in milliseconds.
    pub avg_response_time_ms: f64,
}

/// Append-only liveness sample written periodically by an agent process.
///
/// An agent is considered *active* iff its most recent heartbeat is newer
/// than the configured liveness timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    /// The agent that produced this sample.
    pub agent_id: String,
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
    /// Resource and activity metrics at sample time.
    pub metrics: HeartbeatMetrics,
}

impl Heartbeat {
    /// Creates a heartbeat stamped with the current time.
    pub fn new(agent_id: impl Into<String>, metrics: HeartbeatMetrics) -> Self {
        Self {
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
            metrics,
        }
    }
}
