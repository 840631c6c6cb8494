use drover_core::{
    Agent, AgentDeclaration, AgentKind, AgentStatus, CommandKind, CommandStatus, ControlCommand,
    DroverError, Heartbeat, HeartbeatMetrics, NewTask, NewWorkflow, Priority, RetryPolicy,
    TaskQueueEntry, TaskStatus, WorkflowQueueEntry,
};
use drover_store::{ChangeEvent, CommandStore, QueueStore, RegistryStore, SqliteStore, Topic};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn job_agent() -> Agent {
    Agent::from_declaration(AgentDeclaration::new(AgentKind::Job, "summarizer"))
}

fn accepted(types: &[&str]) -> Vec<String> {
    types.iter().map(|t| (*t).to_string()).collect()
}

#[tokio::test]
async fn test_agent_round_trip() {
    let store = SqliteStore::open_in_memory().unwrap();
    let agent = job_agent();
    store.insert_agent(&agent).await.unwrap();

    let loaded = store.get_agent(&agent.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, agent.id);
    assert_eq!(loaded.kind, AgentKind::Job);
    assert_eq!(loaded.status, AgentStatus::Idle);
    assert_eq!(loaded.capability_tag, "summarizer");
}

#[tokio::test]
async fn test_agent_survives_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("drover.db");
    let agent = job_agent();
    {
        let store = SqliteStore::open(&path).unwrap();
        store.insert_agent(&agent).await.unwrap();
    }
    let store = SqliteStore::open(&path).unwrap();
    assert!(store.get_agent(&agent.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_terminated_is_absorbing() {
    let store = SqliteStore::open_in_memory().unwrap();
    let agent = job_agent();
    store.insert_agent(&agent).await.unwrap();

    store
        .set_agent_status(&agent.id, AgentStatus::Terminated)
        .await
        .unwrap();
    // Re-terminating is a no-op success.
    store
        .set_agent_status(&agent.id, AgentStatus::Terminated)
        .await
        .unwrap();

    let err = store
        .set_agent_status(&agent.id, AgentStatus::Running)
        .await
        .unwrap_err();
    assert!(matches!(err, DroverError::InvalidTransition(_)));
}

#[tokio::test]
async fn test_set_status_on_missing_agent() {
    let store = SqliteStore::open_in_memory().unwrap();
    let err = store
        .set_agent_status("nope", AgentStatus::Running)
        .await
        .unwrap_err();
    assert!(matches!(err, DroverError::NotFound(_)));
}

#[tokio::test]
async fn test_liveness_window_boundary() {
    let store = SqliteStore::open_in_memory().unwrap();
    let fresh = job_agent();
    let stale = job_agent();
    store.insert_agent(&fresh).await.unwrap();
    store.insert_agent(&stale).await.unwrap();

    let mut hb = Heartbeat::new(&fresh.id, HeartbeatMetrics::default());
    hb.timestamp = chrono::Utc::now() - chrono::Duration::seconds(89);
    store.append_heartbeat(&hb).await.unwrap();

    let mut hb = Heartbeat::new(&stale.id, HeartbeatMetrics::default());
    hb.timestamp = chrono::Utc::now() - chrono::Duration::seconds(91);
    store.append_heartbeat(&hb).await.unwrap();

    let active = store
        .list_active_agents(Duration::from_secs(90))
        .await
        .unwrap();
    let ids: Vec<&str> = active.iter().map(|a| a.id.as_str()).collect();
    assert!(ids.contains(&fresh.id.as_str()));
    assert!(!ids.contains(&stale.id.as_str()));
}

#[tokio::test]
async fn test_terminated_agent_never_active() {
    let store = SqliteStore::open_in_memory().unwrap();
    let agent = job_agent();
    store.insert_agent(&agent).await.unwrap();
    store
        .append_heartbeat(&Heartbeat::new(&agent.id, HeartbeatMetrics::default()))
        .await
        .unwrap();
    store
        .set_agent_status(&agent.id, AgentStatus::Terminated)
        .await
        .unwrap();

    let active = store
        .list_active_agents(Duration::from_secs(90))
        .await
        .unwrap();
    assert!(active.is_empty());
}

#[tokio::test]
async fn test_latest_heartbeat_wins() {
    let store = SqliteStore::open_in_memory().unwrap();
    let agent = job_agent();
    store.insert_agent(&agent).await.unwrap();

    let mut old = Heartbeat::new(&agent.id, HeartbeatMetrics::default());
    old.timestamp = chrono::Utc::now() - chrono::Duration::seconds(600);
    store.append_heartbeat(&old).await.unwrap();

    let recent = Heartbeat::new(
        &agent.id,
        HeartbeatMetrics {
            active_jobs: 3,
            ..HeartbeatMetrics::default()
        },
    );
    store.append_heartbeat(&recent).await.unwrap();

    let latest = store.latest_heartbeat(&agent.id).await.unwrap().unwrap();
    assert_eq!(latest.metrics.active_jobs, 3);
}

#[tokio::test]
async fn test_claim_returns_none_on_empty_queue() {
    let store = SqliteStore::open_in_memory().unwrap();
    let claimed = store
        .claim_next_task("agent-1", &accepted(&["file-processing"]))
        .await
        .unwrap();
    assert!(claimed.is_none());
}

#[tokio::test]
async fn test_claim_marks_processing_and_sets_owner() {
    let store = SqliteStore::open_in_memory().unwrap();
    let entry = TaskQueueEntry::from_request(
        NewTask::new("file-processing", Priority::Medium).with_payload(json!({"url": "x"})),
    );
    store.insert_task(&entry).await.unwrap();

    let claimed = store
        .claim_next_task("agent-1", &accepted(&["file-processing"]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, entry.id);
    assert_eq!(claimed.status, TaskStatus::Processing);
    assert_eq!(claimed.agent_id.as_deref(), Some("agent-1"));
    assert!(claimed.started_at.is_some());

    // Nothing left to claim.
    let again = store
        .claim_next_task("agent-2", &accepted(&["file-processing"]))
        .await
        .unwrap();
    assert!(again.is_none());
}

#[tokio::test]
async fn test_at_most_once_claim_under_contention() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let entry = TaskQueueEntry::from_request(NewTask::new("file-processing", Priority::Medium));
    store.insert_task(&entry).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .claim_next_task(&format!("agent-{i}"), &accepted(&["file-processing"]))
                .await
                .unwrap()
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_claim_respects_scheduled_for() {
    let store = SqliteStore::open_in_memory().unwrap();
    let entry = TaskQueueEntry::from_request(
        NewTask::new("file-processing", Priority::Critical)
            .scheduled_at(chrono::Utc::now() + chrono::Duration::hours(1)),
    );
    store.insert_task(&entry).await.unwrap();

    let claimed = store
        .claim_next_task("agent-1", &accepted(&["file-processing"]))
        .await
        .unwrap();
    assert!(claimed.is_none());
}

#[tokio::test]
async fn test_claim_filters_by_accepted_types() {
    let store = SqliteStore::open_in_memory().unwrap();
    let entry = TaskQueueEntry::from_request(NewTask::new("email-classification", Priority::High));
    store.insert_task(&entry).await.unwrap();

    assert!(store
        .claim_next_task("agent-1", &accepted(&["file-processing"]))
        .await
        .unwrap()
        .is_none());
    assert!(store
        .claim_next_task("agent-1", &accepted(&["email-classification", "file-processing"]))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_due_retrying_task_is_claimable_again() {
    let store = SqliteStore::open_in_memory().unwrap();
    let entry = TaskQueueEntry::from_request(NewTask::new("file-processing", Priority::Medium));
    store.insert_task(&entry).await.unwrap();

    let claimed = store
        .claim_next_task("agent-1", &accepted(&["file-processing"]))
        .await
        .unwrap()
        .unwrap();
    let failed = store
        .fail_task("agent-1", claimed.id, "boom", &RetryPolicy::immediate())
        .await
        .unwrap();
    assert_eq!(failed.status, TaskStatus::Retrying);
    assert_eq!(failed.retry_count, 1);

    // With a zero-delay policy the entry is immediately eligible again.
    let reclaimed = store
        .claim_next_task("agent-2", &accepted(&["file-processing"]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reclaimed.id, entry.id);
    assert_eq!(reclaimed.agent_id.as_deref(), Some("agent-2"));
    assert_eq!(reclaimed.retry_count, 1);
}

#[tokio::test]
async fn test_complete_task_merges_result() {
    let store = SqliteStore::open_in_memory().unwrap();
    let entry = TaskQueueEntry::from_request(
        NewTask::new("file-processing", Priority::Medium).with_metadata(json!({"source": "inbox"})),
    );
    store.insert_task(&entry).await.unwrap();
    let claimed = store
        .claim_next_task("agent-1", &accepted(&["file-processing"]))
        .await
        .unwrap()
        .unwrap();

    let done = store
        .complete_task("agent-1", claimed.id, json!({"rows": 10}))
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.completed_at.is_some());
    assert_eq!(done.metadata, json!({"source": "inbox", "rows": 10}));

    // And the merge is durable, not just in the returned value.
    let stored = store.get_task(claimed.id).await.unwrap().unwrap();
    assert_eq!(stored.metadata, json!({"source": "inbox", "rows": 10}));
}

#[tokio::test]
async fn test_complete_twice_reports_terminal_state() {
    let store = SqliteStore::open_in_memory().unwrap();
    let entry = TaskQueueEntry::from_request(NewTask::new("file-processing", Priority::Medium));
    store.insert_task(&entry).await.unwrap();
    let claimed = store
        .claim_next_task("agent-1", &accepted(&["file-processing"]))
        .await
        .unwrap()
        .unwrap();
    store
        .complete_task("agent-1", claimed.id, json!({}))
        .await
        .unwrap();

    let err = store
        .complete_task("agent-1", claimed.id, json!({}))
        .await
        .unwrap_err();
    match err {
        DroverError::NotFound(msg) => assert!(msg.contains("completed"), "got: {msg}"),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn test_complete_by_non_owner_fails() {
    let store = SqliteStore::open_in_memory().unwrap();
    let entry = TaskQueueEntry::from_request(NewTask::new("file-processing", Priority::Medium));
    store.insert_task(&entry).await.unwrap();
    let claimed = store
        .claim_next_task("agent-1", &accepted(&["file-processing"]))
        .await
        .unwrap()
        .unwrap();

    let err = store
        .complete_task("agent-2", claimed.id, json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, DroverError::NotFound(_)));
}

#[tokio::test]
async fn test_retry_exhaustion_ends_failed() {
    let store = SqliteStore::open_in_memory().unwrap();
    let entry = TaskQueueEntry::from_request(
        NewTask::new("file-processing", Priority::Medium).with_max_retries(2),
    );
    store.insert_task(&entry).await.unwrap();
    let policy = RetryPolicy::immediate();

    for attempt in 0..3 {
        let claimed = store
            .claim_next_task("agent-1", &accepted(&["file-processing"]))
            .await
            .unwrap()
            .unwrap();
        let failed = store
            .fail_task("agent-1", claimed.id, "boom", &policy)
            .await
            .unwrap();
        if attempt < 2 {
            assert_eq!(failed.status, TaskStatus::Retrying);
        } else {
            assert_eq!(failed.status, TaskStatus::Failed);
            assert_eq!(failed.retry_count, 2);
            assert_eq!(failed.error.as_deref(), Some("boom"));
        }
    }
    assert!(store
        .claim_next_task("agent-1", &accepted(&["file-processing"]))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_queue_metrics_counts_and_avg() {
    let store = SqliteStore::open_in_memory().unwrap();
    let done = TaskQueueEntry::from_request(NewTask::new("file-processing", Priority::Medium));
    store.insert_task(&done).await.unwrap();
    let claimed = store
        .claim_next_task("agent-1", &accepted(&["file-processing"]))
        .await
        .unwrap()
        .unwrap();
    store
        .complete_task("agent-1", claimed.id, json!({}))
        .await
        .unwrap();

    let pending = TaskQueueEntry::from_request(
        NewTask::new("file-processing", Priority::Critical).with_target("agent-1"),
    );
    store.insert_task(&pending).await.unwrap();

    let metrics = store.queue_metrics("agent-1").await.unwrap();
    assert_eq!(metrics.completed, 1);
    assert_eq!(metrics.pending, 1);
    assert_eq!(metrics.pending_by_priority.critical, 1);
    assert!(metrics.avg_processing_secs.is_some());
    assert_eq!(metrics.total(), 2);
}

#[tokio::test]
async fn test_retry_failed_tasks_requeues_recent() {
    let store = SqliteStore::open_in_memory().unwrap();
    let entry = TaskQueueEntry::from_request(
        NewTask::new("file-processing", Priority::Medium).with_max_retries(0),
    );
    store.insert_task(&entry).await.unwrap();
    let claimed = store
        .claim_next_task("agent-1", &accepted(&["file-processing"]))
        .await
        .unwrap()
        .unwrap();
    store
        .fail_task("agent-1", claimed.id, "boom", &RetryPolicy::immediate())
        .await
        .unwrap();

    let requeued = store
        .retry_failed_tasks(Duration::from_secs(3600), 10)
        .await
        .unwrap();
    assert_eq!(requeued, 1);

    let entry = store.get_task(claimed.id).await.unwrap().unwrap();
    assert_eq!(entry.status, TaskStatus::Pending);
    assert_eq!(entry.retry_count, 0);
    assert!(entry.error.is_none());
}

#[tokio::test]
async fn test_cleanup_completed_respects_age_and_batch() {
    let store = SqliteStore::open_in_memory().unwrap();
    for _ in 0..3 {
        let entry = TaskQueueEntry::from_request(NewTask::new("file-processing", Priority::Low));
        store.insert_task(&entry).await.unwrap();
        let claimed = store
            .claim_next_task("agent-1", &accepted(&["file-processing"]))
            .await
            .unwrap()
            .unwrap();
        store
            .complete_task("agent-1", claimed.id, json!({}))
            .await
            .unwrap();
    }

    // Nothing old enough yet.
    let deleted = store
        .cleanup_completed_tasks(Duration::from_secs(3600), 10)
        .await
        .unwrap();
    assert_eq!(deleted, 0);

    // Everything qualifies with a zero max_age; batch caps the sweep.
    let deleted = store
        .cleanup_completed_tasks(Duration::from_secs(0), 2)
        .await
        .unwrap();
    assert_eq!(deleted, 2);
    let deleted = store
        .cleanup_completed_tasks(Duration::from_secs(0), 2)
        .await
        .unwrap();
    assert_eq!(deleted, 1);
}

#[tokio::test]
async fn test_reclaim_stuck_tasks_from_dead_agent() {
    let store = SqliteStore::open_in_memory().unwrap();
    let dead = job_agent();
    let alive = job_agent();
    store.insert_agent(&dead).await.unwrap();
    store.insert_agent(&alive).await.unwrap();

    for agent in [&dead, &alive] {
        let entry = TaskQueueEntry::from_request(NewTask::new("file-processing", Priority::Medium));
        store.insert_task(&entry).await.unwrap();
        store
            .claim_next_task(&agent.id, &accepted(&["file-processing"]))
            .await
            .unwrap()
            .unwrap();
    }

    // Only the alive agent has a recent heartbeat.
    store
        .append_heartbeat(&Heartbeat::new(&alive.id, HeartbeatMetrics::default()))
        .await
        .unwrap();
    let mut stale = Heartbeat::new(&dead.id, HeartbeatMetrics::default());
    stale.timestamp = chrono::Utc::now() - chrono::Duration::seconds(600);
    store.append_heartbeat(&stale).await.unwrap();

    let reclaimed = store
        .reclaim_stuck_tasks(Duration::from_secs(90), Duration::from_secs(60), 10)
        .await
        .unwrap();
    assert_eq!(reclaimed, 1);

    // The dead agent's task is claimable again.
    let claimed = store
        .claim_next_task(&alive.id, &accepted(&["file-processing"]))
        .await
        .unwrap();
    assert!(claimed.is_some());
}

#[tokio::test]
async fn test_workflow_claim_and_complete() {
    let store = SqliteStore::open_in_memory().unwrap();
    let entry = WorkflowQueueEntry::from_request(
        NewWorkflow::new("prospect-scoring", Priority::High)
            .with_workflow(json!({"steps": [{"op": "fetch"}, {"op": "score"}]}))
            .with_sub_tasks(vec![json!({"type": "fetch"})]),
    );
    store.insert_workflow(&entry).await.unwrap();

    let claimed = store
        .claim_next_workflow("orchestrator-1", &accepted(&["prospect-scoring"]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.status, TaskStatus::Processing);
    assert_eq!(claimed.orchestrator_id.as_deref(), Some("orchestrator-1"));
    assert_eq!(claimed.sub_tasks.len(), 1);

    let done = store
        .complete_workflow("orchestrator-1", claimed.id, json!({"scored": 4}))
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.metadata, json!({"scored": 4}));
}

#[tokio::test]
async fn test_workflow_fail_retries_then_exhausts() {
    let store = SqliteStore::open_in_memory().unwrap();
    let entry = WorkflowQueueEntry::from_request(
        NewWorkflow::new("prospect-scoring", Priority::Medium).with_max_retries(1),
    );
    store.insert_workflow(&entry).await.unwrap();
    let policy = RetryPolicy::immediate();

    let claimed = store
        .claim_next_workflow("orchestrator-1", &accepted(&["prospect-scoring"]))
        .await
        .unwrap()
        .unwrap();
    let failed = store
        .fail_workflow("orchestrator-1", claimed.id, "step 2 failed", &policy)
        .await
        .unwrap();
    assert_eq!(failed.status, TaskStatus::Retrying);

    let claimed = store
        .claim_next_workflow("orchestrator-2", &accepted(&["prospect-scoring"]))
        .await
        .unwrap()
        .unwrap();
    let failed = store
        .fail_workflow("orchestrator-2", claimed.id, "step 2 failed again", &policy)
        .await
        .unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.retry_count, 1);
}

#[tokio::test]
async fn test_command_round_trip_and_pending_order() {
    let store = SqliteStore::open_in_memory().unwrap();
    let mut first = ControlCommand::new("agent-1", CommandKind::Pause, json!({}));
    first.created_at = chrono::Utc::now() - chrono::Duration::seconds(10);
    let second = ControlCommand::new("agent-1", CommandKind::Resume, json!({}));
    let other = ControlCommand::new("agent-2", CommandKind::Stop, json!({}));
    store.insert_command(&first).await.unwrap();
    store.insert_command(&second).await.unwrap();
    store.insert_command(&other).await.unwrap();

    let pending = store.pending_commands("agent-1").await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id, first.id);
    assert_eq!(pending[1].id, second.id);
}

#[tokio::test]
async fn test_command_status_write_back() {
    let store = SqliteStore::open_in_memory().unwrap();
    let command = ControlCommand::new("agent-1", CommandKind::Update, json!({"level": "debug"}));
    store.insert_command(&command).await.unwrap();

    store
        .set_command_status(command.id, CommandStatus::Failed, Some("handler panicked"))
        .await
        .unwrap();
    let loaded = store.get_command(command.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, CommandStatus::Failed);
    assert_eq!(loaded.error.as_deref(), Some("handler panicked"));

    // Duplicate terminal writes are accepted.
    store
        .set_command_status(command.id, CommandStatus::Failed, Some("handler panicked"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_feed_sees_claim_and_completion() {
    let store = SqliteStore::open_in_memory().unwrap();
    let feed = store.feed();
    let mut rx = feed.subscribe(&Topic::tasks("agent-1"));

    let entry = TaskQueueEntry::from_request(NewTask::new("file-processing", Priority::Medium));
    store.insert_task(&entry).await.unwrap();
    let claimed = store
        .claim_next_task("agent-1", &accepted(&["file-processing"]))
        .await
        .unwrap()
        .unwrap();
    store
        .complete_task("agent-1", claimed.id, json!({"rows": 10}))
        .await
        .unwrap();

    let ChangeEvent::Task(first) = rx.recv().await.unwrap() else {
        panic!("expected task event");
    };
    assert_eq!(first.status, TaskStatus::Processing);
    let ChangeEvent::Task(second) = rx.recv().await.unwrap() else {
        panic!("expected task event");
    };
    assert_eq!(second.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_feed_sees_command_insert() {
    let store = SqliteStore::open_in_memory().unwrap();
    let feed = store.feed();
    let mut rx = feed.subscribe(&Topic::commands("agent-1"));

    let command = ControlCommand::new("agent-1", CommandKind::Start, json!({}));
    store.insert_command(&command).await.unwrap();

    let ChangeEvent::Command(received) = rx.recv().await.unwrap() else {
        panic!("expected command event");
    };
    assert_eq!(received.id, command.id);
    assert_eq!(received.status, CommandStatus::Pending);
}
