use crate::feed::{ChangeEvent, ChangeFeed, Topic};
use crate::schema;
use crate::traits::{CommandStore, QueueStore, RegistryStore};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use drover_core::{
    merge_result, Agent, AgentStatus, CommandStatus, ControlCommand, DroverError, DroverResult,
    Heartbeat, HeartbeatMetrics, Priority, PriorityCounts, QueueMetrics, RetryPolicy,
    TaskQueueEntry, TaskStatus, WorkflowQueueEntry,
};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const AGENT_COLUMNS: &str =
    "id, kind, status, capability_tag, config, metadata, created_at, updated_at";

const TASK_COLUMNS: &str = "id, agent_id, task_type, priority, status, payload, metadata, \
     retry_count, max_retries, scheduled_for, started_at, completed_at, error, created_at, \
     updated_at";

const WORKFLOW_COLUMNS: &str = "id, orchestrator_id, workflow_type, priority, status, workflow, \
     sub_tasks, metadata, retry_count, max_retries, scheduled_for, started_at, completed_at, \
     error, created_at, updated_at";

const COMMAND_COLUMNS: &str =
    "id, agent_id, command, parameters, status, error, created_at, updated_at";

/// Claim ordering: priority band first, FIFO by `scheduled_for` within a
/// band, enqueue order as the final tiebreaker.
const CLAIM_ORDER: &str = "CASE priority WHEN 'critical' THEN 0 WHEN 'high' THEN 1 \
     WHEN 'medium' THEN 2 ELSE 3 END, scheduled_for, created_at";

fn store_err(e: rusqlite::Error) -> DroverError {
    DroverError::Store(e.to_string())
}

/// Fixed-width RFC 3339 so lexicographic TEXT comparison matches time order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DroverResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DroverError::Store(format!("bad timestamp '{s}': {e}")))
}

fn parse_opt_ts(s: Option<&str>) -> DroverResult<Option<DateTime<Utc>>> {
    s.map(parse_ts).transpose()
}

fn parse_json(s: &str) -> DroverResult<serde_json::Value> {
    Ok(serde_json::from_str(s)?)
}

fn parse_uuid(s: &str) -> DroverResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| DroverError::Store(format!("bad uuid '{s}': {e}")))
}

/// Shared ownership guard for complete/fail operations on both queues.
///
/// Reports the observed state in the error so a caller can distinguish an
/// already-terminal entry from one that never existed or was reassigned.
fn guard_owned(
    entity: &str,
    id: Uuid,
    status: TaskStatus,
    owner: Option<&str>,
    caller: &str,
) -> DroverResult<()> {
    if status != TaskStatus::Processing {
        return Err(DroverError::NotFound(format!(
            "{entity} {id} is {status}, not processing"
        )));
    }
    if owner != Some(caller) {
        return Err(DroverError::NotFound(format!(
            "{entity} {id} is processing under a different agent"
        )));
    }
    Ok(())
}

struct RawAgent {
    id: String,
    kind: String,
    status: String,
    capability_tag: String,
    config: String,
    metadata: String,
    created_at: String,
    updated_at: String,
}

fn read_agent(row: &Row<'_>) -> rusqlite::Result<RawAgent> {
    Ok(RawAgent {
        id: row.get(0)?,
        kind: row.get(1)?,
        status: row.get(2)?,
        capability_tag: row.get(3)?,
        config: row.get(4)?,
        metadata: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl RawAgent {
    fn into_agent(self) -> DroverResult<Agent> {
        Ok(Agent {
            id: self.id,
            kind: self.kind.parse()?,
            status: self.status.parse()?,
            capability_tag: self.capability_tag,
            config: parse_json(&self.config)?,
            metadata: parse_json(&self.metadata)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct RawTask {
    id: String,
    agent_id: Option<String>,
    task_type: String,
    priority: String,
    status: String,
    payload: String,
    metadata: String,
    retry_count: u32,
    max_retries: u32,
    scheduled_for: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_task(row: &Row<'_>) -> rusqlite::Result<RawTask> {
    Ok(RawTask {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        task_type: row.get(2)?,
        priority: row.get(3)?,
        status: row.get(4)?,
        payload: row.get(5)?,
        metadata: row.get(6)?,
        retry_count: row.get(7)?,
        max_retries: row.get(8)?,
        scheduled_for: row.get(9)?,
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
        error: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

impl RawTask {
    fn into_entry(self) -> DroverResult<TaskQueueEntry> {
        Ok(TaskQueueEntry {
            id: parse_uuid(&self.id)?,
            agent_id: self.agent_id,
            task_type: self.task_type,
            priority: self.priority.parse()?,
            status: self.status.parse()?,
            payload: parse_json(&self.payload)?,
            metadata: parse_json(&self.metadata)?,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            scheduled_for: parse_ts(&self.scheduled_for)?,
            started_at: parse_opt_ts(self.started_at.as_deref())?,
            completed_at: parse_opt_ts(self.completed_at.as_deref())?,
            error: self.error,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct RawWorkflow {
    id: String,
    orchestrator_id: Option<String>,
    workflow_type: String,
    priority: String,
    status: String,
    workflow: String,
    sub_tasks: String,
    metadata: String,
    retry_count: u32,
    max_retries: u32,
    scheduled_for: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_workflow(row: &Row<'_>) -> rusqlite::Result<RawWorkflow> {
    Ok(RawWorkflow {
        id: row.get(0)?,
        orchestrator_id: row.get(1)?,
        workflow_type: row.get(2)?,
        priority: row.get(3)?,
        status: row.get(4)?,
        workflow: row.get(5)?,
        sub_tasks: row.get(6)?,
        metadata: row.get(7)?,
        retry_count: row.get(8)?,
        max_retries: row.get(9)?,
        scheduled_for: row.get(10)?,
        started_at: row.get(11)?,
        completed_at: row.get(12)?,
        error: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

impl RawWorkflow {
    fn into_entry(self) -> DroverResult<WorkflowQueueEntry> {
        let sub_tasks: Vec<serde_json::Value> = serde_json::from_str(&self.sub_tasks)?;
        Ok(WorkflowQueueEntry {
            id: parse_uuid(&self.id)?,
            orchestrator_id: self.orchestrator_id,
            workflow_type: self.workflow_type,
            priority: self.priority.parse()?,
            status: self.status.parse()?,
            workflow: parse_json(&self.workflow)?,
            sub_tasks,
            metadata: parse_json(&self.metadata)?,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            scheduled_for: parse_ts(&self.scheduled_for)?,
            started_at: parse_opt_ts(self.started_at.as_deref())?,
            completed_at: parse_opt_ts(self.completed_at.as_deref())?,
            error: self.error,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct RawCommand {
    id: String,
    agent_id: String,
    command: String,
    parameters: String,
    status: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_command(row: &Row<'_>) -> rusqlite::Result<RawCommand> {
    Ok(RawCommand {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        command: row.get(2)?,
        parameters: row.get(3)?,
        status: row.get(4)?,
        error: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl RawCommand {
    fn into_command(self) -> DroverResult<ControlCommand> {
        Ok(ControlCommand {
            id: parse_uuid(&self.id)?,
            agent_id: self.agent_id,
            command: self.command.parse()?,
            parameters: parse_json(&self.parameters)?,
            status: self.status.parse()?,
            error: self.error,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

/// SQLite-backed store.
///
/// The connection sits behind a mutex, so every statement — in particular
/// the conditional claim update — executes serialized against the single
/// writer the database requires. Change events are published only after the
/// owning transaction has committed and the lock has been released.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    feed: Arc<ChangeFeed>,
}

impl SqliteStore {
    /// Opens (creating if necessary) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> DroverResult<Self> {
        let conn = Connection::open(path).map_err(store_err)?;
        Self::from_conn(conn)
    }

    /// Opens a private in-memory store. Used by tests and local development.
    pub fn open_in_memory() -> DroverResult<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Self::from_conn(conn)
    }

    fn from_conn(conn: Connection) -> DroverResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(store_err)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(store_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(store_err)?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            feed: Arc::new(ChangeFeed::default()),
        })
    }

    /// Replaces the change feed with one of the given capacity.
    ///
    /// Call before handing out any subscriptions.
    pub fn with_feed_capacity(mut self, capacity: usize) -> Self {
        self.feed = Arc::new(ChangeFeed::new(capacity));
        self
    }

    /// The change-notification hub this store publishes into.
    pub fn feed(&self) -> Arc<ChangeFeed> {
        Arc::clone(&self.feed)
    }

    fn publish_task(&self, entry: TaskQueueEntry) {
        if let Some(agent_id) = entry.agent_id.clone() {
            self.feed
                .publish(&Topic::tasks(&agent_id), ChangeEvent::Task(entry));
        }
    }

    fn publish_task_to(&self, agent_id: &str, entry: TaskQueueEntry) {
        self.feed
            .publish(&Topic::tasks(agent_id), ChangeEvent::Task(entry));
    }

    fn publish_workflow(&self, entry: WorkflowQueueEntry) {
        if let Some(orchestrator_id) = entry.orchestrator_id.clone() {
            self.feed.publish(
                &Topic::workflows(&orchestrator_id),
                ChangeEvent::Workflow(entry),
            );
        }
    }

    fn publish_command(&self, command: ControlCommand) {
        self.feed.publish(
            &Topic::commands(&command.agent_id),
            ChangeEvent::Command(command),
        );
    }
}

#[async_trait]
impl RegistryStore for SqliteStore {
    async fn insert_agent(&self, agent: &Agent) -> DroverResult<()> {
        let config = serde_json::to_string(&agent.config)?;
        let metadata = serde_json::to_string(&agent.metadata)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agents (id, kind, status, capability_tag, config, metadata, \
             created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                agent.id,
                agent.kind.as_str(),
                agent.status.as_str(),
                agent.capability_tag,
                config,
                metadata,
                ts(agent.created_at),
                ts(agent.updated_at),
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_agent(&self, agent_id: &str) -> DroverResult<Option<Agent>> {
        let raw = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
                params![agent_id],
                read_agent,
            )
            .optional()
            .map_err(store_err)?
        };
        raw.map(RawAgent::into_agent).transpose()
    }

    async fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> DroverResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(store_err)?;
        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM agents WHERE id = ?1",
                params![agent_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        let Some(current) = current else {
            return Err(DroverError::NotFound(format!(
                "agent {agent_id} does not exist"
            )));
        };
        let current: AgentStatus = current.parse()?;
        if current == AgentStatus::Terminated {
            if status == AgentStatus::Terminated {
                // Unregistering twice is a no-op success.
                return Ok(());
            }
            return Err(DroverError::InvalidTransition(format!(
                "agent {agent_id} is terminated and cannot become {status}"
            )));
        }
        tx.execute(
            "UPDATE agents SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![agent_id, status.as_str(), ts(Utc::now())],
        )
        .map_err(store_err)?;
        tx.commit().map_err(store_err)?;
        Ok(())
    }

    async fn append_heartbeat(&self, heartbeat: &Heartbeat) -> DroverResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO heartbeats (agent_id, timestamp, cpu, memory, active_jobs, \
             error_count, avg_response_time_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                heartbeat.agent_id,
                ts(heartbeat.timestamp),
                heartbeat.metrics.cpu,
                heartbeat.metrics.memory,
                heartbeat.metrics.active_jobs,
                heartbeat.metrics.error_count,
                heartbeat.metrics.avg_response_time_ms,
            ],
        )
        .map_err(store_err)?;
        // Liveness samples refresh the agent row as well.
        conn.execute(
            "UPDATE agents SET updated_at = ?2 WHERE id = ?1",
            params![heartbeat.agent_id, ts(heartbeat.timestamp)],
        )
        .map_err(store_err)?;
        Ok(())
    }

    async fn latest_heartbeat(&self, agent_id: &str) -> DroverResult<Option<Heartbeat>> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT agent_id, timestamp, cpu, memory, active_jobs, error_count, \
                 avg_response_time_ms FROM heartbeats WHERE agent_id = ?1 \
                 ORDER BY timestamp DESC LIMIT 1",
                params![agent_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, u32>(5)?,
                        row.get::<_, f64>(6)?,
                    ))
                },
            )
            .optional()
            .map_err(store_err)?
        };
        match row {
            Some((agent_id, timestamp, cpu, memory, active_jobs, error_count, avg_ms)) => {
                Ok(Some(Heartbeat {
                    agent_id,
                    timestamp: parse_ts(&timestamp)?,
                    metrics: HeartbeatMetrics {
                        cpu,
                        memory,
                        active_jobs,
                        error_count,
                        avg_response_time_ms: avg_ms,
                    },
                }))
            }
            None => Ok(None),
        }
    }

    async fn list_active_agents(&self, timeout: Duration) -> DroverResult<Vec<Agent>> {
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|e| DroverError::Validation(format!("bad liveness timeout: {e}")))?;
        let cutoff = ts(Utc::now() - timeout);
        let raws = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {AGENT_COLUMNS} FROM agents a \
                     WHERE a.status != 'terminated' AND EXISTS (\
                       SELECT 1 FROM heartbeats h \
                       WHERE h.agent_id = a.id AND h.timestamp > ?1) \
                     ORDER BY a.id"
                ))
                .map_err(store_err)?;
            let rows = stmt
                .query_map(params![cutoff], read_agent)
                .map_err(store_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(store_err)?;
            rows
        };
        raws.into_iter().map(RawAgent::into_agent).collect()
    }
}

#[async_trait]
impl QueueStore for SqliteStore {
    async fn insert_task(&self, entry: &TaskQueueEntry) -> DroverResult<()> {
        let payload = serde_json::to_string(&entry.payload)?;
        let metadata = serde_json::to_string(&entry.metadata)?;
        {
            let conn = self.conn.lock();
            conn.execute(
                &format!(
                    "INSERT INTO task_queue ({TASK_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    entry.id.to_string(),
                    entry.agent_id,
                    entry.task_type,
                    entry.priority.as_str(),
                    entry.status.as_str(),
                    payload,
                    metadata,
                    entry.retry_count,
                    entry.max_retries,
                    ts(entry.scheduled_for),
                    entry.started_at.map(ts),
                    entry.completed_at.map(ts),
                    entry.error,
                    ts(entry.created_at),
                    ts(entry.updated_at),
                ],
            )
            .map_err(store_err)?;
        }
        self.publish_task(entry.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> DroverResult<Option<TaskQueueEntry>> {
        let raw = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM task_queue WHERE id = ?1"),
                params![task_id.to_string()],
                read_task,
            )
            .optional()
            .map_err(store_err)?
        };
        raw.map(RawTask::into_entry).transpose()
    }

    async fn claim_next_task(
        &self,
        agent_id: &str,
        accepted_types: &[String],
    ) -> DroverResult<Option<TaskQueueEntry>> {
        if accepted_types.is_empty() {
            return Ok(None);
        }
        let now = ts(Utc::now());
        let claimed = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(store_err)?;
            // Due retries re-enter the claimable pool first.
            tx.execute(
                "UPDATE task_queue SET status = 'pending', updated_at = ?1 \
                 WHERE status = 'retrying' AND scheduled_for <= ?1",
                params![now],
            )
            .map_err(store_err)?;
            let placeholders = (0..accepted_types.len())
                .map(|i| format!("?{}", i + 3))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "UPDATE task_queue \
                 SET status = 'processing', agent_id = ?1, started_at = ?2, updated_at = ?2 \
                 WHERE id = (\
                   SELECT id FROM task_queue \
                   WHERE status = 'pending' AND scheduled_for <= ?2 \
                     AND task_type IN ({placeholders}) \
                   ORDER BY {CLAIM_ORDER} LIMIT 1) \
                 AND status = 'pending' \
                 RETURNING {TASK_COLUMNS}"
            );
            let mut args: Vec<String> = Vec::with_capacity(accepted_types.len() + 2);
            args.push(agent_id.to_string());
            args.push(now);
            args.extend(accepted_types.iter().cloned());
            let raw = tx
                .query_row(&sql, params_from_iter(args.iter()), read_task)
                .optional()
                .map_err(store_err)?;
            tx.commit().map_err(store_err)?;
            raw
        };
        match claimed {
            Some(raw) => {
                let entry = raw.into_entry()?;
                debug!(task_id = %entry.id, agent_id, "task claimed");
                self.publish_task(entry.clone());
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn complete_task(
        &self,
        agent_id: &str,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> DroverResult<TaskQueueEntry> {
        let now = Utc::now();
        let entry = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(store_err)?;
            let raw = tx
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM task_queue WHERE id = ?1"),
                    params![task_id.to_string()],
                    read_task,
                )
                .optional()
                .map_err(store_err)?;
            let Some(raw) = raw else {
                return Err(DroverError::NotFound(format!(
                    "task {task_id} does not exist"
                )));
            };
            let mut entry = raw.into_entry()?;
            guard_owned("task", task_id, entry.status, entry.agent_id.as_deref(), agent_id)?;
            let metadata = merge_result(&entry.metadata, result);
            let changed = tx
                .execute(
                    "UPDATE task_queue \
                     SET status = 'completed', completed_at = ?2, metadata = ?3, updated_at = ?2 \
                     WHERE id = ?1 AND status = 'processing' AND agent_id = ?4",
                    params![
                        task_id.to_string(),
                        ts(now),
                        serde_json::to_string(&metadata)?,
                        agent_id,
                    ],
                )
                .map_err(store_err)?;
            if changed != 1 {
                return Err(DroverError::NotFound(format!(
                    "task {task_id} was reassigned during completion"
                )));
            }
            tx.commit().map_err(store_err)?;
            entry.status = TaskStatus::Completed;
            entry.completed_at = Some(now);
            entry.metadata = metadata;
            entry.updated_at = now;
            entry
        };
        self.publish_task(entry.clone());
        Ok(entry)
    }

    async fn fail_task(
        &self,
        agent_id: &str,
        task_id: Uuid,
        error: &str,
        retry: &RetryPolicy,
    ) -> DroverResult<TaskQueueEntry> {
        let now = Utc::now();
        let entry = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(store_err)?;
            let raw = tx
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM task_queue WHERE id = ?1"),
                    params![task_id.to_string()],
                    read_task,
                )
                .optional()
                .map_err(store_err)?;
            let Some(raw) = raw else {
                return Err(DroverError::NotFound(format!(
                    "task {task_id} does not exist"
                )));
            };
            let mut entry = raw.into_entry()?;
            guard_owned("task", task_id, entry.status, entry.agent_id.as_deref(), agent_id)?;
            let changed = if entry.retry_count < entry.max_retries {
                let next = now + retry.delay_for(entry.retry_count);
                let changed = tx
                    .execute(
                        "UPDATE task_queue \
                         SET status = 'retrying', retry_count = retry_count + 1, error = ?2, \
                             scheduled_for = ?3, started_at = NULL, updated_at = ?4 \
                         WHERE id = ?1 AND status = 'processing' AND agent_id = ?5",
                        params![task_id.to_string(), error, ts(next), ts(now), agent_id],
                    )
                    .map_err(store_err)?;
                entry.status = TaskStatus::Retrying;
                entry.retry_count += 1;
                entry.scheduled_for = next;
                entry.started_at = None;
                changed
            } else {
                let changed = tx
                    .execute(
                        "UPDATE task_queue SET status = 'failed', error = ?2, updated_at = ?3 \
                         WHERE id = ?1 AND status = 'processing' AND agent_id = ?4",
                        params![task_id.to_string(), error, ts(now), agent_id],
                    )
                    .map_err(store_err)?;
                entry.status = TaskStatus::Failed;
                changed
            };
            if changed != 1 {
                return Err(DroverError::NotFound(format!(
                    "task {task_id} was reassigned during failure handling"
                )));
            }
            tx.commit().map_err(store_err)?;
            entry.error = Some(error.to_string());
            entry.updated_at = now;
            entry
        };
        self.publish_task(entry.clone());
        Ok(entry)
    }

    async fn insert_workflow(&self, entry: &WorkflowQueueEntry) -> DroverResult<()> {
        let workflow = serde_json::to_string(&entry.workflow)?;
        let sub_tasks = serde_json::to_string(&entry.sub_tasks)?;
        let metadata = serde_json::to_string(&entry.metadata)?;
        {
            let conn = self.conn.lock();
            conn.execute(
                &format!(
                    "INSERT INTO workflow_queue ({WORKFLOW_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    entry.id.to_string(),
                    entry.orchestrator_id,
                    entry.workflow_type,
                    entry.priority.as_str(),
                    entry.status.as_str(),
                    workflow,
                    sub_tasks,
                    metadata,
                    entry.retry_count,
                    entry.max_retries,
                    ts(entry.scheduled_for),
                    entry.started_at.map(ts),
                    entry.completed_at.map(ts),
                    entry.error,
                    ts(entry.created_at),
                    ts(entry.updated_at),
                ],
            )
            .map_err(store_err)?;
        }
        self.publish_workflow(entry.clone());
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: Uuid) -> DroverResult<Option<WorkflowQueueEntry>> {
        let raw = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!("SELECT {WORKFLOW_COLUMNS} FROM workflow_queue WHERE id = ?1"),
                params![workflow_id.to_string()],
                read_workflow,
            )
            .optional()
            .map_err(store_err)?
        };
        raw.map(RawWorkflow::into_entry).transpose()
    }

    async fn claim_next_workflow(
        &self,
        orchestrator_id: &str,
        accepted_types: &[String],
    ) -> DroverResult<Option<WorkflowQueueEntry>> {
        if accepted_types.is_empty() {
            return Ok(None);
        }
        let now = ts(Utc::now());
        let claimed = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(store_err)?;
            tx.execute(
                "UPDATE workflow_queue SET status = 'pending', updated_at = ?1 \
                 WHERE status = 'retrying' AND scheduled_for <= ?1",
                params![now],
            )
            .map_err(store_err)?;
            let placeholders = (0..accepted_types.len())
                .map(|i| format!("?{}", i + 3))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "UPDATE workflow_queue \
                 SET status = 'processing', orchestrator_id = ?1, started_at = ?2, updated_at = ?2 \
                 WHERE id = (\
                   SELECT id FROM workflow_queue \
                   WHERE status = 'pending' AND scheduled_for <= ?2 \
                     AND workflow_type IN ({placeholders}) \
                   ORDER BY {CLAIM_ORDER} LIMIT 1) \
                 AND status = 'pending' \
                 RETURNING {WORKFLOW_COLUMNS}"
            );
            let mut args: Vec<String> = Vec::with_capacity(accepted_types.len() + 2);
            args.push(orchestrator_id.to_string());
            args.push(now);
            args.extend(accepted_types.iter().cloned());
            let raw = tx
                .query_row(&sql, params_from_iter(args.iter()), read_workflow)
                .optional()
                .map_err(store_err)?;
            tx.commit().map_err(store_err)?;
            raw
        };
        match claimed {
            Some(raw) => {
                let entry = raw.into_entry()?;
                debug!(workflow_id = %entry.id, orchestrator_id, "workflow claimed");
                self.publish_workflow(entry.clone());
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn complete_workflow(
        &self,
        orchestrator_id: &str,
        workflow_id: Uuid,
        result: serde_json::Value,
    ) -> DroverResult<WorkflowQueueEntry> {
        let now = Utc::now();
        let entry = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(store_err)?;
            let raw = tx
                .query_row(
                    &format!("SELECT {WORKFLOW_COLUMNS} FROM workflow_queue WHERE id = ?1"),
                    params![workflow_id.to_string()],
                    read_workflow,
                )
                .optional()
                .map_err(store_err)?;
            let Some(raw) = raw else {
                return Err(DroverError::NotFound(format!(
                    "workflow {workflow_id} does not exist"
                )));
            };
            let mut entry = raw.into_entry()?;
            guard_owned(
                "workflow",
                workflow_id,
                entry.status,
                entry.orchestrator_id.as_deref(),
                orchestrator_id,
            )?;
            let metadata = merge_result(&entry.metadata, result);
            let changed = tx
                .execute(
                    "UPDATE workflow_queue \
                     SET status = 'completed', completed_at = ?2, metadata = ?3, updated_at = ?2 \
                     WHERE id = ?1 AND status = 'processing' AND orchestrator_id = ?4",
                    params![
                        workflow_id.to_string(),
                        ts(now),
                        serde_json::to_string(&metadata)?,
                        orchestrator_id,
                    ],
                )
                .map_err(store_err)?;
            if changed != 1 {
                return Err(DroverError::NotFound(format!(
                    "workflow {workflow_id} was reassigned during completion"
                )));
            }
            tx.commit().map_err(store_err)?;
            entry.status = TaskStatus::Completed;
            entry.completed_at = Some(now);
            entry.metadata = metadata;
            entry.updated_at = now;
            entry
        };
        self.publish_workflow(entry.clone());
        Ok(entry)
    }

    async fn fail_workflow(
        &self,
        orchestrator_id: &str,
        workflow_id: Uuid,
        error: &str,
        retry: &RetryPolicy,
    ) -> DroverResult<WorkflowQueueEntry> {
        let now = Utc::now();
        let entry = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(store_err)?;
            let raw = tx
                .query_row(
                    &format!("SELECT {WORKFLOW_COLUMNS} FROM workflow_queue WHERE id = ?1"),
                    params![workflow_id.to_string()],
                    read_workflow,
                )
                .optional()
                .map_err(store_err)?;
            let Some(raw) = raw else {
                return Err(DroverError::NotFound(format!(
                    "workflow {workflow_id} does not exist"
                )));
            };
            let mut entry = raw.into_entry()?;
            guard_owned(
                "workflow",
                workflow_id,
                entry.status,
                entry.orchestrator_id.as_deref(),
                orchestrator_id,
            )?;
            let changed = if entry.retry_count < entry.max_retries {
                let next = now + retry.delay_for(entry.retry_count);
                let changed = tx
                    .execute(
                        "UPDATE workflow_queue \
                         SET status = 'retrying', retry_count = retry_count + 1, error = ?2, \
                             scheduled_for = ?3, started_at = NULL, updated_at = ?4 \
                         WHERE id = ?1 AND status = 'processing' AND orchestrator_id = ?5",
                        params![
                            workflow_id.to_string(),
                            error,
                            ts(next),
                            ts(now),
                            orchestrator_id,
                        ],
                    )
                    .map_err(store_err)?;
                entry.status = TaskStatus::Retrying;
                entry.retry_count += 1;
                entry.scheduled_for = next;
                entry.started_at = None;
                changed
            } else {
                let changed = tx
                    .execute(
                        "UPDATE workflow_queue SET status = 'failed', error = ?2, updated_at = ?3 \
                         WHERE id = ?1 AND status = 'processing' AND orchestrator_id = ?4",
                        params![workflow_id.to_string(), error, ts(now), orchestrator_id],
                    )
                    .map_err(store_err)?;
                entry.status = TaskStatus::Failed;
                changed
            };
            if changed != 1 {
                return Err(DroverError::NotFound(format!(
                    "workflow {workflow_id} was reassigned during failure handling"
                )));
            }
            tx.commit().map_err(store_err)?;
            entry.error = Some(error.to_string());
            entry.updated_at = now;
            entry
        };
        self.publish_workflow(entry.clone());
        Ok(entry)
    }

    async fn queue_metrics(&self, agent_id: &str) -> DroverResult<QueueMetrics> {
        let conn = self.conn.lock();
        let mut metrics = QueueMetrics {
            agent_id: agent_id.to_string(),
            ..QueueMetrics::default()
        };

        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM task_queue WHERE agent_id = ?1 GROUP BY status")
            .map_err(store_err)?;
        let counts = stmt
            .query_map(params![agent_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;
        for (status, count) in counts {
            let count = count.max(0) as u64;
            match status.parse::<TaskStatus>()? {
                TaskStatus::Pending => metrics.pending = count,
                TaskStatus::Processing => metrics.processing = count,
                TaskStatus::Completed => metrics.completed = count,
                TaskStatus::Failed => metrics.failed = count,
                TaskStatus::Retrying => metrics.retrying = count,
            }
        }

        let mut stmt = conn
            .prepare(
                "SELECT priority, COUNT(*) FROM task_queue \
                 WHERE agent_id = ?1 AND status = 'pending' GROUP BY priority",
            )
            .map_err(store_err)?;
        let by_priority = stmt
            .query_map(params![agent_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;
        let mut pending_by_priority = PriorityCounts::default();
        for (priority, count) in by_priority {
            let count = count.max(0) as u64;
            match priority.parse::<Priority>()? {
                Priority::Critical => pending_by_priority.critical = count,
                Priority::High => pending_by_priority.high = count,
                Priority::Medium => pending_by_priority.medium = count,
                Priority::Low => pending_by_priority.low = count,
            }
        }
        metrics.pending_by_priority = pending_by_priority;

        let mut stmt = conn
            .prepare(
                "SELECT started_at, completed_at FROM task_queue \
                 WHERE agent_id = ?1 AND status = 'completed' \
                   AND started_at IS NOT NULL AND completed_at IS NOT NULL",
            )
            .map_err(store_err)?;
        let spans = stmt
            .query_map(params![agent_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;
        if !spans.is_empty() {
            let mut total_secs = 0.0;
            for (started, completed) in &spans {
                let span = parse_ts(completed)? - parse_ts(started)?;
                total_secs += span.num_milliseconds() as f64 / 1000.0;
            }
            metrics.avg_processing_secs = Some(total_secs / spans.len() as f64);
        }
        Ok(metrics)
    }

    async fn retry_failed_tasks(&self, max_age: Duration, batch_size: u32) -> DroverResult<u64> {
        let now = Utc::now();
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| DroverError::Validation(format!("bad max_age: {e}")))?;
        let cutoff = ts(now - max_age);
        let requeued = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(store_err)?;
            let ids: Vec<String> = {
                let mut stmt = tx
                    .prepare(
                        "SELECT id FROM task_queue WHERE status = 'failed' AND updated_at >= ?1 \
                         ORDER BY updated_at DESC LIMIT ?2",
                    )
                    .map_err(store_err)?;
                let rows = stmt
                    .query_map(params![cutoff, batch_size], |row| row.get(0))
                    .map_err(store_err)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(store_err)?;
                rows
            };
            let mut rows = Vec::with_capacity(ids.len());
            for id in &ids {
                tx.execute(
                    "UPDATE task_queue SET status = 'pending', retry_count = 0, error = NULL, \
                     scheduled_for = ?2, started_at = NULL, updated_at = ?2 WHERE id = ?1",
                    params![id, ts(now)],
                )
                .map_err(store_err)?;
                let raw = tx
                    .query_row(
                        &format!("SELECT {TASK_COLUMNS} FROM task_queue WHERE id = ?1"),
                        params![id],
                        read_task,
                    )
                    .map_err(store_err)?;
                rows.push(raw);
            }
            tx.commit().map_err(store_err)?;
            rows
        };
        let count = requeued.len() as u64;
        for raw in requeued {
            self.publish_task(raw.into_entry()?);
        }
        Ok(count)
    }

    async fn cleanup_completed_tasks(
        &self,
        max_age: Duration,
        batch_size: u32,
    ) -> DroverResult<u64> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| DroverError::Validation(format!("bad max_age: {e}")))?;
        let cutoff = ts(Utc::now() - max_age);
        let conn = self.conn.lock();
        let deleted = conn
            .execute(
                "DELETE FROM task_queue WHERE id IN (\
                   SELECT id FROM task_queue \
                   WHERE status = 'completed' AND completed_at IS NOT NULL \
                     AND completed_at <= ?1 \
                   ORDER BY completed_at LIMIT ?2)",
                params![cutoff, batch_size],
            )
            .map_err(store_err)?;
        Ok(deleted as u64)
    }

    async fn reclaim_stuck_tasks(
        &self,
        liveness_timeout: Duration,
        grace: Duration,
        batch_size: u32,
    ) -> DroverResult<u64> {
        let now = Utc::now();
        let window = chrono::Duration::from_std(liveness_timeout + grace)
            .map_err(|e| DroverError::Validation(format!("bad reclaim window: {e}")))?;
        let cutoff = ts(now - window);
        let reclaimed = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(store_err)?;
            let stuck: Vec<RawTask> = {
                let mut stmt = tx
                    .prepare(&format!(
                        "SELECT {TASK_COLUMNS} FROM task_queue t \
                         WHERE t.status = 'processing' AND t.agent_id IS NOT NULL \
                           AND NOT EXISTS (\
                             SELECT 1 FROM heartbeats h \
                             WHERE h.agent_id = t.agent_id AND h.timestamp > ?1) \
                         LIMIT ?2"
                    ))
                    .map_err(store_err)?;
                let rows = stmt
                    .query_map(params![cutoff, batch_size], read_task)
                    .map_err(store_err)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(store_err)?;
                rows
            };
            for raw in &stuck {
                tx.execute(
                    "UPDATE task_queue SET status = 'pending', agent_id = NULL, \
                     started_at = NULL, scheduled_for = ?2, updated_at = ?2 \
                     WHERE id = ?1 AND status = 'processing'",
                    params![raw.id, ts(now)],
                )
                .map_err(store_err)?;
            }
            tx.commit().map_err(store_err)?;
            stuck
        };
        let count = reclaimed.len() as u64;
        for raw in reclaimed {
            let previous_owner = raw.agent_id.clone();
            let mut entry = raw.into_entry()?;
            entry.status = TaskStatus::Pending;
            entry.agent_id = None;
            entry.started_at = None;
            entry.scheduled_for = now;
            entry.updated_at = now;
            if let Some(owner) = previous_owner {
                // Notify the previous owner's watchers that the task went back
                // into the pool.
                self.publish_task_to(&owner, entry);
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl CommandStore for SqliteStore {
    async fn insert_command(&self, command: &ControlCommand) -> DroverResult<()> {
        let parameters = serde_json::to_string(&command.parameters)?;
        {
            let conn = self.conn.lock();
            conn.execute(
                &format!(
                    "INSERT INTO control_commands ({COMMAND_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    command.id.to_string(),
                    command.agent_id,
                    command.command.as_str(),
                    parameters,
                    command.status.as_str(),
                    command.error,
                    ts(command.created_at),
                    ts(command.updated_at),
                ],
            )
            .map_err(store_err)?;
        }
        self.publish_command(command.clone());
        Ok(())
    }

    async fn get_command(&self, command_id: Uuid) -> DroverResult<Option<ControlCommand>> {
        let raw = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!("SELECT {COMMAND_COLUMNS} FROM control_commands WHERE id = ?1"),
                params![command_id.to_string()],
                read_command,
            )
            .optional()
            .map_err(store_err)?
        };
        raw.map(RawCommand::into_command).transpose()
    }

    async fn pending_commands(&self, agent_id: &str) -> DroverResult<Vec<ControlCommand>> {
        let raws = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {COMMAND_COLUMNS} FROM control_commands \
                     WHERE agent_id = ?1 AND status = 'pending' ORDER BY created_at"
                ))
                .map_err(store_err)?;
            let rows = stmt
                .query_map(params![agent_id], read_command)
                .map_err(store_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(store_err)?;
            rows
        };
        raws.into_iter().map(RawCommand::into_command).collect()
    }

    async fn set_command_status(
        &self,
        command_id: Uuid,
        status: CommandStatus,
        error: Option<&str>,
    ) -> DroverResult<()> {
        let updated = {
            let conn = self.conn.lock();
            let changed = conn
                .execute(
                    "UPDATE control_commands SET status = ?2, error = ?3, updated_at = ?4 \
                     WHERE id = ?1",
                    params![command_id.to_string(), status.as_str(), error, ts(Utc::now())],
                )
                .map_err(store_err)?;
            if changed == 0 {
                return Err(DroverError::NotFound(format!(
                    "command {command_id} does not exist"
                )));
            }
            conn.query_row(
                &format!("SELECT {COMMAND_COLUMNS} FROM control_commands WHERE id = ?1"),
                params![command_id.to_string()],
                read_command,
            )
            .optional()
            .map_err(store_err)?
        };
        if let Some(raw) = updated {
            self.publish_command(raw.into_command()?);
        }
        Ok(())
    }
}
