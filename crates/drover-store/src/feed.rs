use drover_core::{ControlCommand, TaskQueueEntry, WorkflowQueueEntry};
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Default per-topic broadcast buffer size.
pub const DEFAULT_FEED_CAPACITY: usize = 64;

/// A state change pushed to subscribers after it has been committed.
///
/// Delivery is at-least-once: a lagging subscriber may observe duplicates or
/// gaps and must treat the store as the source of truth.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    /// A task queue entry was inserted or changed state.
    Task(TaskQueueEntry),
    /// A workflow queue entry was inserted or changed state.
    Workflow(WorkflowQueueEntry),
    /// A control command was created or its outcome written back.
    Command(ControlCommand),
}

/// A subscription key scoping change events to one agent or orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    /// Task changes for the given agent or agent-class.
    pub fn tasks(agent_id: &str) -> Self {
        Self(format!("tasks:{agent_id}"))
    }

    /// Workflow changes for the given orchestrator.
    pub fn workflows(orchestrator_id: &str) -> Self {
        Self(format!("workflows:{orchestrator_id}"))
    }

    /// Command traffic for the given agent.
    pub fn commands(agent_id: &str) -> Self {
        Self(format!("commands:{agent_id}"))
    }

    /// The topic key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Topic-keyed publish/subscribe hub for change notifications.
///
/// The feed carries notifications only — it holds no durable state, so the
/// backing store can be swapped without touching any consumer. Topics are
/// created lazily on first subscription and dropped once their last
/// subscriber is gone.
pub struct ChangeFeed {
    capacity: usize,
    topics: parking_lot::Mutex<HashMap<String, broadcast::Sender<ChangeEvent>>>,
}

impl ChangeFeed {
    /// Creates a feed whose per-topic buffers hold `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            topics: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Subscribes to a topic, receiving every event published after this call.
    pub fn subscribe(&self, topic: &Topic) -> broadcast::Receiver<ChangeEvent> {
        let mut topics = self.topics.lock();
        topics
            .entry(topic.as_str().to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publishes an event to a topic. Returns how many subscribers it reached.
    ///
    /// Publishing to a topic nobody listens on is a no-op: the store remains
    /// the source of truth, notifications are an optimisation.
    pub fn publish(&self, topic: &Topic, event: ChangeEvent) -> usize {
        let mut topics = self.topics.lock();
        match topics.get(topic.as_str()) {
            Some(sender) if sender.receiver_count() > 0 => sender.send(event).unwrap_or(0),
            Some(_) => {
                topics.remove(topic.as_str());
                0
            }
            None => 0,
        }
    }

    /// Number of live topics (topics with at least one past subscriber).
    pub fn topic_count(&self) -> usize {
        self.topics.lock().len()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use drover_core::{NewTask, Priority, TaskQueueEntry};

    fn sample_event() -> ChangeEvent {
        ChangeEvent::Task(TaskQueueEntry::from_request(NewTask::new(
            "noop",
            Priority::Low,
        )))
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let feed = ChangeFeed::default();
        assert_eq!(feed.publish(&Topic::tasks("a"), sample_event()), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_published_event() {
        let feed = ChangeFeed::default();
        let topic = Topic::tasks("agent-1");
        let mut rx = feed.subscribe(&topic);

        assert_eq!(feed.publish(&topic, sample_event()), 1);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ChangeEvent::Task(_)));
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let feed = ChangeFeed::default();
        let mut rx_a = feed.subscribe(&Topic::tasks("a"));
        let _rx_b = feed.subscribe(&Topic::tasks("b"));

        feed.publish(&Topic::tasks("b"), sample_event());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_topic_is_pruned_on_publish() {
        let feed = ChangeFeed::default();
        let topic = Topic::tasks("gone");
        drop(feed.subscribe(&topic));
        assert_eq!(feed.topic_count(), 1);

        feed.publish(&topic, sample_event());
        assert_eq!(feed.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_fan_out() {
        let feed = ChangeFeed::default();
        let topic = Topic::commands("agent-1");
        let mut rx1 = feed.subscribe(&topic);
        let mut rx2 = feed.subscribe(&topic);

        assert_eq!(feed.publish(&topic, sample_event()), 2);
        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }
}
