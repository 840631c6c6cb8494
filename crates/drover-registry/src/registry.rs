use crate::heartbeat::{HeartbeatHandle, MetricsSupplier};
use drover_core::{Agent, AgentDeclaration, AgentStatus, DroverError, DroverResult};
use drover_store::RegistryStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Tracks agent identity, declared capabilities, and liveness.
///
/// Every registry instance owns its own heartbeat timers: there is no
/// process-wide state, so several control planes can coexist in one process.
pub struct AgentRegistry {
    store: Arc<dyn RegistryStore>,
    heartbeats: parking_lot::Mutex<HashMap<String, HeartbeatHandle>>,
}

impl AgentRegistry {
    /// Creates a registry over the given store.
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            store,
            heartbeats: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new agent and returns its minted id.
    ///
    /// The declaration's capability tag must be non-empty; the agent starts
    /// out `Idle`.
    pub async fn register(&self, declaration: AgentDeclaration) -> DroverResult<String> {
        if declaration.capability_tag.trim().is_empty() {
            return Err(DroverError::Validation(
                "agent declaration requires a non-empty capability_tag".to_string(),
            ));
        }
        let agent = Agent::from_declaration(declaration);
        self.store.insert_agent(&agent).await?;
        info!(agent_id = %agent.id, kind = %agent.kind, capability = %agent.capability_tag, "agent registered");
        Ok(agent.id)
    }

    /// Terminates an agent. Idempotent: unregistering a terminated agent is
    /// a no-op success. Any heartbeat timer for the agent is stopped.
    pub async fn unregister(&self, agent_id: &str) -> DroverResult<()> {
        self.store
            .set_agent_status(agent_id, AgentStatus::Terminated)
            .await?;
        self.stop_heartbeat(agent_id).await;
        info!(agent_id, "agent unregistered");
        Ok(())
    }

    /// Applies a status change.
    ///
    /// Fails with `InvalidTransition` when the agent is terminated and with
    /// `NotFound` when it does not exist.
    pub async fn update_status(&self, agent_id: &str, status: AgentStatus) -> DroverResult<()> {
        self.store.set_agent_status(agent_id, status).await
    }

    /// Fetches an agent by id.
    pub async fn get(&self, agent_id: &str) -> DroverResult<Option<Agent>> {
        self.store.get_agent(agent_id).await
    }

    /// All non-terminated agents with a heartbeat inside `timeout`.
    pub async fn list_active(&self, timeout: Duration) -> DroverResult<Vec<Agent>> {
        self.store.list_active_agents(timeout).await
    }

    /// Starts a recurring heartbeat timer for an agent.
    ///
    /// A previous timer for the same agent is shut down and replaced.
    pub fn start_heartbeat(
        &self,
        agent_id: &str,
        supplier: Arc<dyn MetricsSupplier>,
        interval: Duration,
    ) {
        let handle = HeartbeatHandle::start(
            agent_id.to_string(),
            Arc::clone(&self.store),
            supplier,
            interval,
        );
        let replaced = self.heartbeats.lock().insert(agent_id.to_string(), handle);
        if let Some(old) = replaced {
            old.signal_shutdown();
        }
    }

    /// Stops an agent's heartbeat timer, flushing any buffered samples.
    /// Safe to call when none is running.
    pub async fn stop_heartbeat(&self, agent_id: &str) {
        let handle = self.heartbeats.lock().remove(agent_id);
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    /// Stops every heartbeat timer. Called on control-plane shutdown.
    pub async fn stop_all_heartbeats(&self) {
        let handles: Vec<HeartbeatHandle> = {
            let mut heartbeats = self.heartbeats.lock();
            heartbeats.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.stop().await;
        }
    }
}
