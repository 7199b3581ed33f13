pub mod assignment;
pub mod engine;
pub mod queue;
pub mod registry;
pub mod task;

pub use assignment::{Assignment, AssignmentTable};
pub use engine::{DispatchEngine, EngineSummary};
pub use queue::TaskQueue;
pub use registry::{AgentHealth, AgentRegistry, AgentState, HealthSignal};
pub use task::{Outcome, ResourceProfile, Task, TaskPayload, TaskSpec, TaskState};
