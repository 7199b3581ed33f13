use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::registry::HealthSignal;
use crate::scheduler::task::{Outcome, ResourceProfile, Task, TaskPayload, TaskSpec, TaskState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Identity from a previous registration, if the agent has one
    pub agent_id: Option<Uuid>,
    pub hostname: String,
    pub address: String,
    pub version: String,
    pub capacity: u32,
    #[serde(default)]
    pub labels: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub agent_id: Uuid,
    pub heartbeat_interval_ms: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: Uuid,
    pub load: u32,
    #[serde(default)]
    pub signal: HealthSignal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Assignments waiting in the agent's mailbox
    pub pending_assignments: usize,
    /// Tasks the agent should kill
    #[serde(default)]
    pub cancel: Vec<Uuid>,
    /// Authoritative slot count
    pub capacity: u32,
}

/// One attempt handed to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentMessage {
    pub task_id: Uuid,
    pub attempt: u32,
    pub payload: TaskPayload,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollQuery {
    pub agent_id: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollResponse {
    pub assignments: Vec<AssignmentMessage>,
    #[serde(default)]
    pub cancel: Vec<Uuid>,
}

/// What an agent reports about an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOutcome {
    /// Accepted and the child process is starting
    Started,
    Succeeded,
    Failed,
    /// No free slot, hand the task to someone else
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub agent_id: Uuid,
    pub task_id: Uuid,
    pub attempt: u32,
    pub outcome: ReportOutcome,
    #[serde(default)]
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    /// Tail of stdout/stderr
    pub summary: Option<String>,
    pub error: Option<String>,
}

impl ReportRequest {
    pub fn new(agent_id: Uuid, assignment: &AssignmentMessage, outcome: ReportOutcome) -> Self {
        Self {
            agent_id,
            task_id: assignment.task_id,
            attempt: assignment.attempt,
            outcome,
            duration_ms: 0,
            exit_code: None,
            summary: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportResponse {
    /// False when the report was for a superseded attempt and got dropped
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub payload: TaskPayload,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub profile: ResourceProfile,
    /// Per-attempt wall-clock budget in seconds
    pub deadline_secs: Option<u64>,
}

impl From<SubmitRequest> for TaskSpec {
    fn from(req: SubmitRequest) -> Self {
        let spec = TaskSpec::new(req.payload)
            .with_priority(req.priority)
            .with_profile(req.profile);
        match req.deadline_secs {
            Some(secs) => spec.with_timeout(Duration::from_secs(secs)),
            None => spec,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityRequest {
    pub capacity: u32,
}

/// Requester-facing task status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: Uuid,
    pub state: TaskState,
    pub priority: u8,
    pub attempt: u32,
    pub retry_count: u32,
    pub assigned_agent: Option<Uuid>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<Outcome>,
    pub exit_code: Option<i32>,
    pub summary: Option<String>,
    /// `"<error class>: <message>"` of the last failed attempt
    pub reason: Option<String>,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            state: task.state,
            priority: task.priority,
            attempt: task.attempt,
            retry_count: task.retry_count,
            assigned_agent: task.assigned_agent,
            submitted_at: task.submitted_at,
            finished_at: task.finished_at,
            outcome: task.outcome,
            exit_code: task.exit_code,
            summary: task.summary.clone(),
            reason: task
                .last_error
                .as_ref()
                .map(|e| format!("{}: {}", e.class, e.message)),
        }
    }
}

/// JSON body of every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}
