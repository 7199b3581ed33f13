use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{FabricError, Result};
use crate::scheduler::task::{Outcome, ResourceProfile, Task, TaskError, TaskSpec, TaskState};

const DEFAULT_MAX_TASKS: usize = 10_000;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_FAIRNESS_BURST: u32 = 8;

/// Backlog of build sub-tasks and the owner of their state.
///
/// Ordering is highest priority first, FIFO inside a priority class. A pick
/// that passes over an older eligible task counts towards a bypass streak;
/// once the streak reaches `fairness_burst` the oldest eligible task is
/// handed out instead, so low-priority work cannot starve.
#[derive(Debug)]
pub struct TaskQueue {
    tasks: HashMap<Uuid, Task>,
    reserved: HashSet<Uuid>,
    max_tasks: usize,
    max_retries: u32,
    fairness_burst: u32,
    bypass_streak: u32,
    next_seq: u64,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_TASKS)
    }

    pub fn with_capacity(max_tasks: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            reserved: HashSet::new(),
            max_tasks,
            max_retries: DEFAULT_MAX_RETRIES,
            fairness_burst: DEFAULT_FAIRNESS_BURST,
            bypass_streak: 0,
            next_seq: 0,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_fairness_burst(mut self, burst: u32) -> Self {
        self.fairness_burst = burst;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Accept a new task in `Pending`. Fails with `QueueFull` at capacity.
    pub fn submit(&mut self, spec: TaskSpec, default_timeout: Duration) -> Result<Uuid> {
        if self.is_full() {
            return Err(FabricError::QueueFull);
        }
        let task = Task::new(spec, default_timeout, self.next_seq);
        self.next_seq += 1;
        let id = task.id;
        tracing::debug!(task_id = %id, priority = task.priority, "Task submitted");
        self.tasks.insert(id, task);
        Ok(id)
    }

    pub fn get_task(&self, id: &Uuid) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Reserve the next dispatchable task whose profile `accepts` allows.
    ///
    /// The task stays reserved, and invisible to further calls, until
    /// [`confirm`](Self::confirm) or [`release`](Self::release).
    pub fn next<F>(&mut self, accepts: F) -> Option<Uuid>
    where
        F: Fn(&ResourceProfile) -> bool,
    {
        let eligible: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.state.is_dispatchable() && !self.reserved.contains(&t.id))
            .filter(|t| accepts(&t.profile))
            .collect();

        let best = eligible
            .iter()
            .min_by_key(|t| (Reverse(t.priority), t.seq))?;
        let oldest = eligible.iter().min_by_key(|t| t.seq)?;

        let picked = if best.id == oldest.id {
            self.bypass_streak = 0;
            best.id
        } else if self.bypass_streak >= self.fairness_burst {
            tracing::debug!(
                task_id = %oldest.id,
                streak = self.bypass_streak,
                "Fairness pick of oldest eligible task"
            );
            self.bypass_streak = 0;
            oldest.id
        } else {
            self.bypass_streak += 1;
            best.id
        };

        self.reserved.insert(picked);
        Some(picked)
    }

    /// Give a reserved task back without assigning it.
    pub fn release(&mut self, id: &Uuid) {
        self.reserved.remove(id);
    }

    /// Bind a reserved task to an agent. Returns the new attempt number.
    pub fn confirm(&mut self, id: &Uuid, agent_id: Uuid) -> Result<u32> {
        if !self.reserved.remove(id) {
            return Err(FabricError::InvalidState(format!(
                "task {} was not reserved",
                id
            )));
        }
        let task = self
            .tasks
            .get_mut(id)
            .ok_or(FabricError::TaskNotFound(*id))?;
        if !task.state.is_dispatchable() {
            return Err(FabricError::InvalidState(format!(
                "task {} is {}",
                id, task.state
            )));
        }
        task.state = TaskState::Assigned;
        task.assigned_agent = Some(agent_id);
        task.attempt += 1;
        Ok(task.attempt)
    }

    pub fn mark_running(&mut self, id: &Uuid) -> Result<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or(FabricError::TaskNotFound(*id))?;
        match task.state {
            TaskState::Assigned => {
                task.state = TaskState::Running;
                Ok(())
            }
            TaskState::Running => Ok(()),
            other => Err(FabricError::InvalidState(format!(
                "task {} cannot start from {}",
                id, other
            ))),
        }
    }

    /// Return a task to the queue after a failed attempt, or fail it for good
    /// when the retry bound is exhausted. Returns the resulting state.
    pub fn requeue(&mut self, id: &Uuid, outcome: Outcome, error: TaskError) -> Result<TaskState> {
        let max_retries = self.max_retries;
        self.reserved.remove(id);
        let task = self
            .tasks
            .get_mut(id)
            .ok_or(FabricError::TaskNotFound(*id))?;
        if task.state.is_terminal() {
            return Err(FabricError::InvalidState(format!(
                "task {} is already {}",
                id, task.state
            )));
        }

        task.assigned_agent = None;
        if task.retry_count >= max_retries {
            task.state = TaskState::Failed;
            task.outcome = Some(outcome);
            task.finished_at = Some(Utc::now());
            tracing::warn!(
                task_id = %id,
                retries = task.retry_count,
                error = %error.message,
                "Task failed, retries exhausted"
            );
        } else {
            task.retry_count += 1;
            task.state = TaskState::Requeued;
            tracing::info!(
                task_id = %id,
                retry = task.retry_count,
                reason = %error.message,
                "Task requeued"
            );
        }
        task.last_error = Some(error);
        Ok(task.state)
    }

    /// Fail a task outright, bypassing the retry bound.
    pub fn abort(&mut self, id: &Uuid, error: TaskError) -> Result<()> {
        self.reserved.remove(id);
        let task = self
            .tasks
            .get_mut(id)
            .ok_or(FabricError::TaskNotFound(*id))?;
        if task.state.is_terminal() {
            return Ok(());
        }
        task.state = TaskState::Failed;
        task.outcome = Some(Outcome::Failed);
        task.assigned_agent = None;
        task.finished_at = Some(Utc::now());
        task.last_error = Some(error);
        Ok(())
    }

    pub fn complete(&mut self, id: &Uuid, exit_code: Option<i32>, summary: Option<String>) -> Result<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or(FabricError::TaskNotFound(*id))?;
        if !task.state.is_live() {
            return Err(FabricError::InvalidState(format!(
                "task {} cannot succeed from {}",
                id, task.state
            )));
        }
        task.state = TaskState::Succeeded;
        task.outcome = Some(Outcome::Succeeded);
        task.exit_code = exit_code;
        task.summary = summary;
        task.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Record execution details of the latest attempt without changing state.
    pub fn note_result(&mut self, id: &Uuid, exit_code: Option<i32>, summary: Option<String>) {
        if let Some(task) = self.tasks.get_mut(id) {
            task.exit_code = exit_code;
            task.summary = summary;
        }
    }

    pub fn cancel(&mut self, id: &Uuid) -> Result<TaskState> {
        self.reserved.remove(id);
        let task = self
            .tasks
            .get_mut(id)
            .ok_or(FabricError::TaskNotFound(*id))?;
        if task.state.is_terminal() {
            return Err(FabricError::InvalidState(format!(
                "task {} is already {}",
                id, task.state
            )));
        }
        let previous = task.state;
        task.state = TaskState::Cancelled;
        task.outcome = Some(Outcome::Cancelled);
        task.assigned_agent = None;
        task.finished_at = Some(Utc::now());
        Ok(previous)
    }

    /// All tasks in submission order
    pub fn all_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    pub fn dispatchable_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.state.is_dispatchable())
            .count()
    }

    pub fn count_in_state(&self, state: TaskState) -> usize {
        self.tasks.values().filter(|t| t.state == state).count()
    }

    /// Drop terminal tasks finished before `cutoff`. Returns how many went.
    pub fn cleanup_finished(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, task| {
            !(task.state.is_terminal() && task.finished_at.is_some_and(|at| at < cutoff))
        });
        before - self.tasks.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.tasks.len() >= self.max_tasks
    }
}
