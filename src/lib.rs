// Clippy allows for reasonable defaults
#![allow(clippy::new_without_default)] // Default not always appropriate for stateful types
#![allow(clippy::derivable_impls)] // Explicit Default impls can be clearer
#![allow(clippy::field_reassign_with_default)] // Builder pattern is clearer
#![allow(clippy::unnecessary_map_or)] // map_or can be clearer than alternatives

// Module declarations
pub mod agents;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod file_storage;
pub mod message_bus;
pub mod models;
pub mod runtime;
pub mod shared_state;
pub mod shutdown;
pub mod task_queue;
mod utils;

pub use agents::{
    AgentError, AgentInstance, AgentRegistry, AgentRunner, AgentSummary, AssignError, FnRunner,
    RunContext, ThreadPool, ToolRegistry, WorkProvider, WorkerPool,
};
pub use config::{ConfigManager, RuntimeConfig};
pub use coordinator::{
    AgentConflict, AgentCoordinator, AggregateResult, ConflictResolution, ConflictType,
    CoordinatorConfig, CoordinatorError, ResolutionStrategy,
};
pub use message_bus::{AgentMessage, BusError, MessageBus, MessagePriority, MessageType};
pub use models::*;
pub use runtime::{Collaborators, Runtime};
pub use shared_state::{SharedState, StateError};
pub use shutdown::{ShutdownHandler, ShutdownResult, ShutdownState};
pub use task_queue::{QueueError, TaskQueue};

/// Install the `env_logger` backend (`RUST_LOG`, default `info`).
/// Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

/// Logger for tests: captured output, debug level
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}
