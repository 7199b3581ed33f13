//! Durable history of task attempts.
//!
//! Every attempt that ends, whatever the reason, produces exactly one
//! [`ResultRecord`]. Records are append-only and keyed by
//! `(task_id, attempt)`. Terminal tasks are archived alongside so that
//! `GET /task/{id}` keeps answering after the in-memory copy is evicted.
//!
//! - [`MemoryStore`]: process-local, used by tests and `--database` less runs
//! - [`SqliteStore`]: relational store queried by the dashboard

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::task::{Outcome, Task};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Immutable outcome of one task attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub task_id: Uuid,
    /// `None` when the attempt never reached an agent
    pub agent_id: Option<Uuid>,
    pub attempt: u32,
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Dashboard filter over result records. All fields are optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultQuery {
    pub agent_id: Option<Uuid>,
    pub outcome: Option<Outcome>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ResultQuery {
    pub fn matches(&self, record: &ResultRecord) -> bool {
        self.agent_id.is_none_or(|id| record.agent_id == Some(id))
            && self.outcome.is_none_or(|o| record.outcome == o)
            && self.since.is_none_or(|t| record.recorded_at >= t)
            && self.until.is_none_or(|t| record.recorded_at < t)
    }
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Append a record. Re-appending an existing `(task_id, attempt)` is a no-op.
    async fn append(&self, record: &ResultRecord) -> Result<()>;

    /// Store the final snapshot of a terminal task.
    async fn archive_task(&self, task: &Task) -> Result<()>;

    /// Records of one task ordered by attempt
    async fn records_for_task(&self, task_id: Uuid) -> Result<Vec<ResultRecord>>;

    /// Records matching `query`, oldest first
    async fn query(&self, query: &ResultQuery) -> Result<Vec<ResultRecord>>;

    async fn find_task(&self, task_id: Uuid) -> Result<Option<Task>>;
}
