use async_trait::async_trait;
use drover_core::{Heartbeat, HeartbeatMetrics};
use drover_store::RegistryStore;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Upper bound on samples kept while the store is unreachable. When the
/// buffer is full the oldest sample is dropped — recent liveness data is
/// worth more than old.
const MAX_BUFFERED_SAMPLES: usize = 32;

/// Produces the metrics embedded in each heartbeat sample.
///
/// Implemented for any `Fn() -> HeartbeatMetrics` closure, so simple agents
/// can pass a plain function.
#[async_trait]
pub trait MetricsSupplier: Send + Sync {
    /// Takes one metrics sample.
    async fn sample(&self) -> HeartbeatMetrics;
}

#[async_trait]
impl<F> MetricsSupplier for F
where
    F: Fn() -> HeartbeatMetrics + Send + Sync,
{
    async fn sample(&self) -> HeartbeatMetrics {
        (self)()
    }
}

/// A running heartbeat timer for one agent.
///
/// Each tick samples the supplier and appends a heartbeat row. Publish
/// failures are logged, the sample is re-buffered, and the write is retried
/// on the next tick — a flaky store never surfaces to the agent's main
/// control flow. On shutdown the buffer gets one final flush attempt.
pub struct HeartbeatHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub(crate) fn start(
        agent_id: String,
        store: Arc<dyn RegistryStore>,
        supplier: Arc<dyn MetricsSupplier>,
        interval: Duration,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut buffer: VecDeque<Heartbeat> = VecDeque::new();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let metrics = supplier.sample().await;
                        buffer.push_back(Heartbeat::new(&agent_id, metrics));
                        if buffer.len() > MAX_BUFFERED_SAMPLES {
                            buffer.pop_front();
                            warn!(agent_id = %agent_id, "heartbeat buffer full, dropped oldest sample");
                        }
                        flush(store.as_ref(), &agent_id, &mut buffer).await;
                    }
                    _ = shutdown_rx.changed() => {
                        flush(store.as_ref(), &agent_id, &mut buffer).await;
                        break;
                    }
                }
            }
        });
        Self { shutdown, task }
    }

    /// Signals the timer to stop and waits for the final flush.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }

    /// Signals shutdown without waiting. Used when a handle is replaced.
    pub(crate) fn signal_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn flush(store: &dyn RegistryStore, agent_id: &str, buffer: &mut VecDeque<Heartbeat>) {
    while let Some(heartbeat) = buffer.front() {
        match store.append_heartbeat(heartbeat).await {
            Ok(()) => {
                buffer.pop_front();
            }
            Err(e) => {
                warn!(
                    agent_id,
                    error = %e,
                    buffered = buffer.len(),
                    "heartbeat publish failed, will retry on next tick"
                );
                break;
            }
        }
    }
}
