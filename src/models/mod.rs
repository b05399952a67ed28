// Data models shared by the queue, registry and coordinator

pub mod agent;
pub mod state_machine;
pub mod task;

pub use agent::{AgentState, AgentType, Capabilities};
pub use task::{ProgressCallback, Task, TaskCallback, TaskId, TaskPriority, TaskState, TaskType};
