// Agent instances, their runners, the registry that owns them and the worker pool

pub mod instance;
pub mod pool;
pub mod providers;
pub mod registry;
pub mod runner;

// Re-export for convenience
pub use instance::{AgentError, AgentInstance, AgentStats, AgentSummary, AssignError};
pub use pool::{Job, ThreadPool, WorkerPool};
pub use providers::{
    get_runner, AutonomousRunner, BuildRunner, CoordinatorRunner, FnRunner, SmartRunner,
};
pub use registry::AgentRegistry;
pub use runner::{AgentRunner, ProgressSink, RunContext, ToolRegistry, WorkProvider};
