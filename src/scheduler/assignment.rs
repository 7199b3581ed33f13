use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{FabricError, Result};

/// Binding of one task to one agent for one attempt.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub task_id: Uuid,
    pub agent_id: Uuid,
    pub attempt: u32,
    pub assigned_at: DateTime<Utc>,
    pub started_at: Instant,
    /// Wall-clock deadline handed to the agent
    pub deadline: DateTime<Utc>,
    /// After this the timeout monitor reclaims the attempt
    pub expires_at: Instant,
}

impl Assignment {
    pub fn new(
        task_id: Uuid,
        agent_id: Uuid,
        attempt: u32,
        timeout: Duration,
        grace: Duration,
        now: Instant,
    ) -> Result<Self> {
        let out_of_range = || FabricError::InvalidState(format!("deadline of task {} is out of range", task_id));
        let assigned_at = Utc::now();
        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|budget| assigned_at.checked_add_signed(budget))
            .ok_or_else(out_of_range)?;
        let expires_at = timeout
            .checked_add(grace)
            .and_then(|budget| now.checked_add(budget))
            .ok_or_else(out_of_range)?;
        Ok(Self {
            task_id,
            agent_id,
            attempt,
            assigned_at,
            started_at: now,
            deadline,
            expires_at,
        })
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }
}

/// Live assignments, at most one per task.
#[derive(Debug, Default)]
pub struct AssignmentTable {
    by_task: HashMap<Uuid, Assignment>,
}

impl AssignmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, assignment: Assignment) -> Result<()> {
        if let Some(live) = self.by_task.get(&assignment.task_id) {
            return Err(FabricError::InvalidState(format!(
                "task {} already has live attempt {} on agent {}",
                live.task_id, live.attempt, live.agent_id
            )));
        }
        self.by_task.insert(assignment.task_id, assignment);
        Ok(())
    }

    pub fn get(&self, task_id: &Uuid) -> Option<&Assignment> {
        self.by_task.get(task_id)
    }

    /// The live assignment if it is exactly `agent_id`'s attempt `attempt`.
    pub fn live_attempt(&self, task_id: &Uuid, agent_id: &Uuid, attempt: u32) -> Result<&Assignment> {
        self.by_task
            .get(task_id)
            .filter(|a| a.agent_id == *agent_id && a.attempt == attempt)
            .ok_or(FabricError::StaleAttempt {
                task_id: *task_id,
                attempt,
            })
    }

    pub fn remove(&mut self, task_id: &Uuid) -> Option<Assignment> {
        self.by_task.remove(task_id)
    }

    /// Tasks whose assignment expired at `now`
    pub fn expired(&self, now: Instant) -> Vec<Uuid> {
        self.by_task
            .values()
            .filter(|a| a.expires_at <= now)
            .map(|a| a.task_id)
            .collect()
    }

    pub fn for_agent(&self, agent_id: &Uuid) -> Vec<&Assignment> {
        self.by_task
            .values()
            .filter(|a| a.agent_id == *agent_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_task.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_task.is_empty()
    }
}
