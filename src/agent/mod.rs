//! Worker-side agent process.
//!
//! - [`AgentRuntime`]: registration, heartbeats, polling and slot accounting
//! - [`TaskExecutor`]: runs one payload as a child process with a deadline
//! - [`AgentIdentity`]: id persisted in the work directory across restarts
//! - [`ProcessLock`]: one agent per work directory
//!
//! Each accepted assignment runs in its own spawned task holding a
//! semaphore permit, so a busy or panicking task never blocks heartbeats.

pub mod executor;
pub mod identity;
pub mod lock;
pub mod runtime;

pub use executor::{ExecutionResult, ExecutionStatus, TaskExecutor};
pub use identity::AgentIdentity;
pub use lock::ProcessLock;
pub use runtime::AgentRuntime;
