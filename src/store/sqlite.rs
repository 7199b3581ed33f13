use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{FabricError, Result};
use crate::scheduler::task::{Outcome, Task};
use crate::store::{ResultQuery, ResultRecord, ResultStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS results (
    task_id     TEXT    NOT NULL,
    attempt     INTEGER NOT NULL,
    agent_id    TEXT,
    outcome     TEXT    NOT NULL,
    duration_ms INTEGER NOT NULL,
    exit_code   INTEGER,
    detail      TEXT,
    recorded_at TEXT    NOT NULL,
    PRIMARY KEY (task_id, attempt)
);
CREATE INDEX IF NOT EXISTS idx_results_recorded_at ON results (recorded_at);
CREATE INDEX IF NOT EXISTS idx_results_agent ON results (agent_id, recorded_at);
CREATE INDEX IF NOT EXISTS idx_results_outcome ON results (outcome, recorded_at);

CREATE TABLE IF NOT EXISTS tasks (
    task_id      TEXT    PRIMARY KEY,
    state        TEXT    NOT NULL,
    priority     INTEGER NOT NULL,
    retry_count  INTEGER NOT NULL,
    attempts     INTEGER NOT NULL,
    submitted_at TEXT    NOT NULL,
    finished_at  TEXT,
    snapshot     TEXT    NOT NULL
);
";

/// Raw row: (task_id, attempt, agent_id, outcome, duration_ms, exit_code, detail, recorded_at)
type ResultRow = (
    String,
    u32,
    Option<String>,
    String,
    i64,
    Option<i32>,
    Option<String>,
    String,
);

/// SQLite-backed result store. Blocking calls run on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| FabricError::Store("connection mutex poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| FabricError::Store(format!("store task failed: {}", e)))?
    }
}

fn timestamp(t: &DateTime<Utc>) -> String {
    // Fixed-width so lexical order matches time order
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| FabricError::Store(format!("bad timestamp {:?}: {}", s, e)))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| FabricError::Store(format!("bad uuid {:?}: {}", s, e)))
}

fn record_from_row(row: ResultRow) -> Result<ResultRecord> {
    let (task_id, attempt, agent_id, outcome, duration_ms, exit_code, detail, recorded_at) = row;
    Ok(ResultRecord {
        task_id: parse_uuid(&task_id)?,
        agent_id: agent_id.as_deref().map(parse_uuid).transpose()?,
        attempt,
        outcome: Outcome::parse(&outcome)
            .ok_or_else(|| FabricError::Store(format!("unknown outcome {:?}", outcome)))?,
        duration_ms: duration_ms.max(0) as u64,
        exit_code,
        detail,
        recorded_at: parse_timestamp(&recorded_at)?,
    })
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResultRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

const RESULT_COLUMNS: &str =
    "task_id, attempt, agent_id, outcome, duration_ms, exit_code, detail, recorded_at";

#[async_trait]
impl ResultStore for SqliteStore {
    async fn append(&self, record: &ResultRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO results
                    (task_id, attempt, agent_id, outcome, duration_ms, exit_code, detail, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.task_id.to_string(),
                    record.attempt,
                    record.agent_id.map(|id| id.to_string()),
                    record.outcome.as_str(),
                    record.duration_ms as i64,
                    record.exit_code,
                    record.detail,
                    timestamp(&record.recorded_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn archive_task(&self, task: &Task) -> Result<()> {
        let snapshot = serde_json::to_string(task)?;
        let task = task.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO tasks
                    (task_id, state, priority, retry_count, attempts, submitted_at, finished_at, snapshot)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    task.id.to_string(),
                    task.state.to_string(),
                    task.priority,
                    task.retry_count,
                    task.attempt,
                    timestamp(&task.submitted_at),
                    task.finished_at.as_ref().map(timestamp),
                    snapshot,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn records_for_task(&self, task_id: Uuid) -> Result<Vec<ResultRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM results WHERE task_id = ?1 ORDER BY attempt ASC",
                RESULT_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![task_id.to_string()], read_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(record_from_row).collect()
        })
        .await
    }

    async fn query(&self, query: &ResultQuery) -> Result<Vec<ResultRecord>> {
        let query = query.clone();
        self.with_conn(move |conn| {
            let mut clauses = Vec::new();
            let mut values: Vec<String> = Vec::new();
            if let Some(agent_id) = query.agent_id {
                values.push(agent_id.to_string());
                clauses.push(format!("agent_id = ?{}", values.len()));
            }
            if let Some(outcome) = query.outcome {
                values.push(outcome.as_str().to_string());
                clauses.push(format!("outcome = ?{}", values.len()));
            }
            if let Some(since) = query.since {
                values.push(timestamp(&since));
                clauses.push(format!("recorded_at >= ?{}", values.len()));
            }
            if let Some(until) = query.until {
                values.push(timestamp(&until));
                clauses.push(format!("recorded_at < ?{}", values.len()));
            }

            let mut sql = format!("SELECT {} FROM results", RESULT_COLUMNS);
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
            sql.push_str(" ORDER BY recorded_at ASC, task_id ASC, attempt ASC");
            if let Some(limit) = query.limit {
                sql.push_str(&format!(" LIMIT {}", limit));
            }

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), read_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(record_from_row).collect()
        })
        .await
    }

    async fn find_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        self.with_conn(move |conn| {
            let snapshot: Option<String> = conn
                .query_row(
                    "SELECT snapshot FROM tasks WHERE task_id = ?1",
                    params![task_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            snapshot
                .map(|s| serde_json::from_str(&s).map_err(FabricError::from))
                .transpose()
        })
        .await
    }
}
