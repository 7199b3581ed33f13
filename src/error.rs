use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum FabricError {
    /// Transient transport failure. Callers retry with backoff.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Trust token rejected. Fatal for the agent process.
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Task execution failed: {0}")]
    TaskExecution(String),

    #[error("Agent {0} has no free slots")]
    CapacityExceeded(Uuid),

    #[error("Stale report for task {task_id} attempt {attempt}")]
    StaleAttempt { task_id: Uuid, attempt: u32 },

    #[error("Unknown agent: {0}")]
    UnknownAgent(Uuid),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Task queue is at capacity")]
    QueueFull,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Result store error: {0}")]
    Store(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FabricError {
    /// Short machine-readable code, carried in HTTP error bodies and task views.
    pub fn code(&self) -> &'static str {
        match self {
            FabricError::Connection(_) => "connection",
            FabricError::Auth(_) => "auth",
            FabricError::TaskExecution(_) => "task_execution",
            FabricError::CapacityExceeded(_) => "capacity_exceeded",
            FabricError::StaleAttempt { .. } => "stale_attempt",
            FabricError::UnknownAgent(_) => "unknown_agent",
            FabricError::TaskNotFound(_) => "task_not_found",
            FabricError::QueueFull => "queue_full",
            FabricError::InvalidState(_) => "invalid_state",
            FabricError::Store(_) => "store",
            FabricError::Protocol(_) => "protocol",
            FabricError::Io(_) => "io",
            FabricError::Internal(_) => "internal",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FabricError::Connection(_))
    }
}

impl From<rusqlite::Error> for FabricError {
    fn from(e: rusqlite::Error) -> Self {
        FabricError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for FabricError {
    fn from(e: serde_json::Error) -> Self {
        FabricError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FabricError>;
