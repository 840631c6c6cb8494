use drover_core::{DroverError, DroverResult};
use rusqlite::Connection;

/// Idempotent schema bootstrap, run on every store open.
pub fn init(conn: &Connection) -> DroverResult<()> {
    conn.execute_batch(SCHEMA)
        .map_err(|e| DroverError::Store(format!("schema init failed: {e}")))
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
    id              TEXT PRIMARY KEY,
    kind            TEXT NOT NULL,
    status          TEXT NOT NULL,
    capability_tag  TEXT NOT NULL,
    config          TEXT NOT NULL,
    metadata        TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS heartbeats (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id             TEXT NOT NULL,
    timestamp            TEXT NOT NULL,
    cpu                  REAL NOT NULL,
    memory               REAL NOT NULL,
    active_jobs          INTEGER NOT NULL,
    error_count          INTEGER NOT NULL,
    avg_response_time_ms REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_heartbeats_agent_ts
    ON heartbeats (agent_id, timestamp DESC);

CREATE TABLE IF NOT EXISTS task_queue (
    id             TEXT PRIMARY KEY,
    agent_id       TEXT,
    task_type      TEXT NOT NULL,
    priority       TEXT NOT NULL,
    status         TEXT NOT NULL,
    payload        TEXT NOT NULL,
    metadata       TEXT NOT NULL,
    retry_count    INTEGER NOT NULL DEFAULT 0,
    max_retries    INTEGER NOT NULL DEFAULT 3,
    scheduled_for  TEXT NOT NULL,
    started_at     TEXT,
    completed_at   TEXT,
    error          TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_queue_claim
    ON task_queue (status, scheduled_for);
CREATE INDEX IF NOT EXISTS idx_task_queue_agent
    ON task_queue (agent_id);

CREATE TABLE IF NOT EXISTS workflow_queue (
    id              TEXT PRIMARY KEY,
    orchestrator_id TEXT,
    workflow_type   TEXT NOT NULL,
    priority        TEXT NOT NULL,
    status          TEXT NOT NULL,
    workflow        TEXT NOT NULL,
    sub_tasks       TEXT NOT NULL,
    metadata        TEXT NOT NULL,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    max_retries     INTEGER NOT NULL DEFAULT 3,
    scheduled_for   TEXT NOT NULL,
    started_at      TEXT,
    completed_at    TEXT,
    error           TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_workflow_queue_claim
    ON workflow_queue (status, scheduled_for);
CREATE INDEX IF NOT EXISTS idx_workflow_queue_orchestrator
    ON workflow_queue (orchestrator_id);

CREATE TABLE IF NOT EXISTS control_commands (
    id          TEXT PRIMARY KEY,
    agent_id    TEXT NOT NULL,
    command     TEXT NOT NULL,
    parameters  TEXT NOT NULL,
    status      TEXT NOT NULL,
    error       TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_commands_agent_status
    ON control_commands (agent_id, status);
"#;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        init(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        for expected in [
            "agents",
            "control_commands",
            "heartbeats",
            "task_queue",
            "workflow_queue",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }
    }
}
