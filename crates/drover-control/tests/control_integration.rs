use async_trait::async_trait;
use drover_control::{
    AgentDeclaration, AgentKind, ChangeEvent, CommandHandler, CommandKind, CommandStatus,
    ControlCommand, ControlPlane, ControlPlaneConfig, DroverError, DroverResult, HeartbeatMetrics,
    NewTask, Priority, RetryPolicy, TaskStatus,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn test_config() -> ControlPlaneConfig {
    ControlPlaneConfig {
        retry: RetryPolicy::immediate(),
        ..ControlPlaneConfig::default()
    }
}

fn plane() -> ControlPlane {
    ControlPlane::open(test_config()).unwrap()
}

fn accepted(types: &[&str]) -> Vec<String> {
    types.iter().map(|t| (*t).to_string()).collect()
}

struct AckHandler;

#[async_trait]
impl CommandHandler for AckHandler {
    async fn handle(&self, _command: &ControlCommand) -> DroverResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_end_to_end_task_lifecycle() {
    init_tracing();
    let plane = plane();
    let agent_id = plane
        .register(AgentDeclaration::new(AgentKind::Job, "file-processing"))
        .await
        .unwrap();

    let task_id = plane
        .enqueue_task(
            NewTask::new("file-processing", Priority::Medium).with_payload(json!({"url": "x"})),
        )
        .await
        .unwrap();

    let claimed = plane
        .claim_next_task(&agent_id, &accepted(&["file-processing"]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, task_id);
    assert_eq!(claimed.payload, json!({"url": "x"}));

    let done = plane
        .complete_task(&agent_id, task_id, json!({"rows": 10}))
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.completed_at.is_some());
    assert_eq!(done.metadata, json!({"rows": 10}));

    // Completing again is distinguishable from "never existed": the error
    // names the terminal state.
    let err = plane
        .complete_task(&agent_id, task_id, json!({"rows": 10}))
        .await
        .unwrap_err();
    match err {
        DroverError::NotFound(msg) => assert!(msg.contains("completed"), "got: {msg}"),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn test_task_updates_stream_for_watchers() {
    let plane = plane();
    let agent_id = plane
        .register(AgentDeclaration::new(AgentKind::Job, "file-processing"))
        .await
        .unwrap();
    // A dashboard subscribes before any work happens.
    let mut updates = plane.subscribe_task_updates(&agent_id);

    let task_id = plane
        .enqueue_task(NewTask::new("file-processing", Priority::High))
        .await
        .unwrap();
    let claimed = plane
        .claim_next_task(&agent_id, &accepted(&["file-processing"]))
        .await
        .unwrap()
        .unwrap();
    plane
        .complete_task(&agent_id, claimed.id, json!({}))
        .await
        .unwrap();

    let ChangeEvent::Task(first) = updates.recv().await.unwrap() else {
        panic!("expected a task event");
    };
    assert_eq!(first.id, task_id);
    assert_eq!(first.status, TaskStatus::Processing);

    let ChangeEvent::Task(second) = updates.recv().await.unwrap() else {
        panic!("expected a task event");
    };
    assert_eq!(second.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_heartbeats_drive_list_active() {
    let plane = plane();
    let agent_id = plane
        .register(AgentDeclaration::new(AgentKind::Job, "file-processing"))
        .await
        .unwrap();
    assert!(plane.list_active().await.unwrap().is_empty());

    plane.start_heartbeat_with_interval(
        &agent_id,
        Arc::new(HeartbeatMetrics::default),
        Duration::from_millis(20),
    );
    tokio::time::sleep(Duration::from_millis(60)).await;

    let active = plane.list_active().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, agent_id);

    plane.cleanup().await;
}

#[tokio::test]
async fn test_command_round_trip_through_facade() {
    let plane = plane();
    let agent_id = plane
        .register(AgentDeclaration::new(AgentKind::Job, "file-processing"))
        .await
        .unwrap();
    plane.subscribe_commands(&agent_id, Arc::new(AckHandler));

    let command_id = plane
        .send_command(&agent_id, CommandKind::Pause, json!({"drain": true}))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let command = plane.get_command(command_id).await.unwrap().unwrap();
        if command.status == CommandStatus::Completed {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "command never consumed"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    plane.cleanup().await;
}

#[tokio::test]
async fn test_cleanup_stops_heartbeats() {
    let plane = plane();
    let agent_id = plane
        .register(AgentDeclaration::new(AgentKind::Job, "file-processing"))
        .await
        .unwrap();
    plane.start_heartbeat_with_interval(
        &agent_id,
        Arc::new(HeartbeatMetrics::default),
        Duration::from_millis(15),
    );
    tokio::time::sleep(Duration::from_millis(40)).await;
    plane.cleanup().await;

    // Liveness decays once the timer is gone: with a tiny window the agent
    // drops out of the active set shortly after cleanup.
    tokio::time::sleep(Duration::from_millis(80)).await;
    let active = plane
        .list_active_within(Duration::from_millis(50))
        .await
        .unwrap();
    assert!(active.is_empty());
}

#[tokio::test]
async fn test_two_planes_are_isolated_in_one_process() {
    let plane_a = plane();
    let plane_b = plane();

    plane_a
        .enqueue_task(NewTask::new("file-processing", Priority::Medium))
        .await
        .unwrap();

    // Separate stores: plane B sees nothing to claim.
    let claimed = plane_b
        .claim_next_task("agent-b", &accepted(&["file-processing"]))
        .await
        .unwrap();
    assert!(claimed.is_none());
}

#[tokio::test]
async fn test_file_backed_plane_persists_across_instances() {
    let tmp = tempfile::tempdir().unwrap();
    let config = ControlPlaneConfig {
        store_path: Some(tmp.path().join("drover.db")),
        ..test_config()
    };

    let task_id = {
        let plane = ControlPlane::open(config.clone()).unwrap();
        plane
            .enqueue_task(NewTask::new("file-processing", Priority::Medium))
            .await
            .unwrap()
    };

    let plane = ControlPlane::open(config).unwrap();
    let claimed = plane
        .claim_next_task("agent-1", &accepted(&["file-processing"]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, task_id);
}

#[tokio::test]
async fn test_reclaim_uses_configured_liveness() {
    let plane = plane();
    let agent_id = plane
        .register(AgentDeclaration::new(AgentKind::Job, "file-processing"))
        .await
        .unwrap();
    plane
        .enqueue_task(NewTask::new("file-processing", Priority::Medium))
        .await
        .unwrap();
    plane
        .claim_next_task(&agent_id, &accepted(&["file-processing"]))
        .await
        .unwrap()
        .unwrap();

    // The agent never heartbeated, so its processing task is reclaimable.
    let reclaimed = plane
        .reclaim_stuck_tasks(Duration::from_secs(0), 10)
        .await
        .unwrap();
    assert_eq!(reclaimed, 1);

    let again = plane
        .claim_next_task("agent-2", &accepted(&["file-processing"]))
        .await
        .unwrap();
    assert!(again.is_some());
}
