use async_trait::async_trait;
use drover_core::{CommandKind, CommandStatus, ControlCommand, DroverResult};
use drover_store::{ChangeEvent, ChangeFeed, CommandStore, Topic};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// The agent-side callback invoked for each delivered command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Executes one command. An `Err` marks the command failed with the
    /// error's message; the subscription itself keeps running either way.
    async fn handle(&self, command: &ControlCommand) -> DroverResult<()>;
}

/// Pushes control commands to agents and tracks their acknowledgment.
///
/// Subscriptions ride on the store's change feed: delivery is at-least-once,
/// so each notification is checked against the store before the handler runs
/// and commands that are no longer pending are skipped.
pub struct CommandChannel {
    store: Arc<dyn CommandStore>,
    feed: Arc<ChangeFeed>,
    subscriptions: parking_lot::Mutex<HashMap<String, JoinHandle<()>>>,
}

impl CommandChannel {
    /// Creates a channel over the given store and its change feed.
    pub fn new(store: Arc<dyn CommandStore>, feed: Arc<ChangeFeed>) -> Self {
        Self {
            store,
            feed,
            subscriptions: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Inserts a pending command for `agent_id` and returns its id.
    pub async fn send_command(
        &self,
        agent_id: &str,
        command: CommandKind,
        parameters: serde_json::Value,
    ) -> DroverResult<Uuid> {
        let command = ControlCommand::new(agent_id, command, parameters);
        self.store.insert_command(&command).await?;
        info!(command_id = %command.id, agent_id, kind = %command.command, "command sent");
        Ok(command.id)
    }

    /// Starts consuming commands for `agent_id`, replacing any previous
    /// subscription for the same agent.
    ///
    /// Commands already pending at subscribe time are delivered first, then
    /// the subscription follows the change feed. A handler error marks the
    /// command failed with the captured error and processing continues — one
    /// bad command never kills the subscription.
    pub fn subscribe_commands(&self, agent_id: &str, handler: Arc<dyn CommandHandler>) {
        let store = Arc::clone(&self.store);
        let feed = Arc::clone(&self.feed);
        let agent = agent_id.to_string();
        let task = tokio::spawn(async move {
            run_subscription(store, feed, agent, handler).await;
        });
        let replaced = self.subscriptions.lock().insert(agent_id.to_string(), task);
        if let Some(old) = replaced {
            old.abort();
        }
    }

    /// Stops the subscription for `agent_id`, if any.
    pub fn unsubscribe_commands(&self, agent_id: &str) {
        if let Some(task) = self.subscriptions.lock().remove(agent_id) {
            task.abort();
        }
    }

    /// Fetches a command by id.
    pub async fn get_command(&self, command_id: Uuid) -> DroverResult<Option<ControlCommand>> {
        self.store.get_command(command_id).await
    }

    /// Writes back a command outcome.
    ///
    /// Idempotent: duplicate terminal writes are accepted, not rejected.
    pub async fn update_command_status(
        &self,
        command_id: Uuid,
        status: CommandStatus,
        error: Option<&str>,
    ) -> DroverResult<()> {
        self.store
            .set_command_status(command_id, status, error)
            .await
    }

    /// Aborts every subscription. Called on control-plane shutdown.
    pub fn shutdown(&self) {
        for (_, task) in self.subscriptions.lock().drain() {
            task.abort();
        }
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_subscription(
    store: Arc<dyn CommandStore>,
    feed: Arc<ChangeFeed>,
    agent_id: String,
    handler: Arc<dyn CommandHandler>,
) {
    let mut rx = feed.subscribe(&Topic::commands(&agent_id));
    // Commands sent before the subscription existed are only in the store.
    drain_pending(store.as_ref(), &agent_id, handler.as_ref()).await;
    loop {
        match rx.recv().await {
            Ok(ChangeEvent::Command(command)) => {
                dispatch(store.as_ref(), handler.as_ref(), &command).await;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => {
                warn!(agent_id = %agent_id, missed, "command subscription lagged, re-reading pending");
                drain_pending(store.as_ref(), &agent_id, handler.as_ref()).await;
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn drain_pending(store: &dyn CommandStore, agent_id: &str, handler: &dyn CommandHandler) {
    match store.pending_commands(agent_id).await {
        Ok(commands) => {
            for command in commands {
                dispatch(store, handler, &command).await;
            }
        }
        Err(e) => warn!(agent_id, error = %e, "failed to read pending commands"),
    }
}

async fn dispatch(store: &dyn CommandStore, handler: &dyn CommandHandler, command: &ControlCommand) {
    // Delivery is at-least-once; only a still-pending command is consumed.
    let current = match store.get_command(command.id).await {
        Ok(Some(current)) if current.status == CommandStatus::Pending => current,
        Ok(_) => return,
        Err(e) => {
            warn!(command_id = %command.id, error = %e, "failed to re-read command");
            return;
        }
    };
    let (status, error) = match handler.handle(&current).await {
        Ok(()) => (CommandStatus::Completed, None),
        Err(e) => {
            warn!(command_id = %current.id, error = %e, "command handler failed");
            (CommandStatus::Failed, Some(e.to_string()))
        }
    };
    if let Err(e) = store
        .set_command_status(current.id, status, error.as_deref())
        .await
    {
        warn!(command_id = %current.id, error = %e, "failed to write command outcome");
    }
}
