use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Assigned,
    Running,
    Succeeded,
    Failed,
    /// Returned to the queue after a failed attempt, waiting for redispatch
    Requeued,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// States the queue may hand out to the dispatcher.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Requeued)
    }

    /// States backed by a live assignment.
    pub fn is_live(&self) -> bool {
        matches!(self, TaskState::Assigned | TaskState::Running)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Assigned => write!(f, "assigned"),
            TaskState::Running => write!(f, "running"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Requeued => write!(f, "requeued"),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
    TimedOut,
    /// The agent died or restarted while holding the attempt
    AgentLost,
    /// The agent refused the assignment for lack of free slots
    Rejected,
    DeliveryFailed,
    Cancelled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
            Outcome::TimedOut => "timed_out",
            Outcome::AgentLost => "agent_lost",
            Outcome::Rejected => "rejected",
            Outcome::DeliveryFailed => "delivery_failed",
            Outcome::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "succeeded" => Outcome::Succeeded,
            "failed" => Outcome::Failed,
            "timed_out" => Outcome::TimedOut,
            "agent_lost" => Outcome::AgentLost,
            "rejected" => Outcome::Rejected,
            "delivery_failed" => Outcome::DeliveryFailed,
            "cancelled" => Outcome::Cancelled,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource requirements an agent must satisfy to run a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceProfile {
    /// Every label here must be advertised by the agent
    #[serde(default)]
    pub labels: BTreeSet<String>,
}

impl ResourceProfile {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    pub fn satisfied_by(&self, agent_labels: &BTreeSet<String>) -> bool {
        self.labels.is_subset(agent_labels)
    }
}

/// Opaque command the agent runs. With no `args`, `command` is a shell line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl TaskPayload {
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }
}

/// Error class and message of the most recent failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub class: String,
    pub message: String,
}

/// What a requester submits.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub payload: TaskPayload,
    pub priority: u8,
    pub profile: ResourceProfile,
    /// Wall-clock budget of each attempt
    pub timeout: Option<Duration>,
}

impl TaskSpec {
    pub fn new(payload: TaskPayload) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_profile(mut self, profile: ResourceProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub payload: TaskPayload,
    pub profile: ResourceProfile,
    /// Higher runs first
    pub priority: u8,
    pub state: TaskState,
    pub assigned_agent: Option<Uuid>,
    /// Attempt number of the current or most recent assignment, 0 before the first
    pub attempt: u32,
    pub retry_count: u32,
    pub submitted_at: DateTime<Utc>,
    /// Submission order, the FIFO tie-break inside a priority class
    pub seq: u64,
    pub timeout_ms: u64,
    pub last_error: Option<TaskError>,
    pub outcome: Option<Outcome>,
    pub exit_code: Option<i32>,
    pub summary: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(spec: TaskSpec, default_timeout: Duration, seq: u64) -> Self {
        let timeout = spec.timeout.unwrap_or(default_timeout);
        Self {
            id: Uuid::new_v4(),
            payload: spec.payload,
            profile: spec.profile,
            priority: spec.priority,
            state: TaskState::Pending,
            assigned_agent: None,
            attempt: 0,
            retry_count: 0,
            submitted_at: Utc::now(),
            seq,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            last_error: None,
            outcome: None,
            exit_code: None,
            summary: None,
            finished_at: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
