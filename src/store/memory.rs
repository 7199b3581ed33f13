use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::task::Task;
use crate::store::{ResultQuery, ResultRecord, ResultStore};

/// Process-local result store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<Vec<ResultRecord>>,
    tasks: RwLock<HashMap<Uuid, Task>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn append(&self, record: &ResultRecord) -> Result<()> {
        let mut records = self.records.write().await;
        let exists = records
            .iter()
            .any(|r| r.task_id == record.task_id && r.attempt == record.attempt);
        if !exists {
            records.push(record.clone());
        }
        Ok(())
    }

    async fn archive_task(&self, task: &Task) -> Result<()> {
        self.tasks.write().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn records_for_task(&self, task_id: Uuid) -> Result<Vec<ResultRecord>> {
        let mut records: Vec<ResultRecord> = self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.attempt);
        Ok(records)
    }

    async fn query(&self, query: &ResultQuery) -> Result<Vec<ResultRecord>> {
        let mut records: Vec<ResultRecord> = self
            .records
            .read()
            .await
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.recorded_at, r.task_id, r.attempt));
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn find_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        Ok(self.tasks.read().await.get(&task_id).cloned())
    }
}
