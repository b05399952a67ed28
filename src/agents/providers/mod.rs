// Runner implementations for each agent type

mod autonomous_runner;
mod build_runner;
mod coordinator_runner;
mod fn_runner;
mod smart_runner;

use crate::agents::runner::{AgentRunner, ToolRegistry, WorkProvider};
use crate::models::AgentType;
use std::sync::Arc;

pub use autonomous_runner::{parse_tool_call, AutonomousRunner, ToolCall};
pub use build_runner::BuildRunner;
pub use coordinator_runner::{parse_plan, CoordinatorRunner};
pub use fn_runner::FnRunner;
pub use smart_runner::SmartRunner;

/// Build the runner for an agent type. Custom agents bring their own runner.
pub fn get_runner(
    agent_type: AgentType,
    provider: &Arc<dyn WorkProvider>,
    tools: &Arc<dyn ToolRegistry>,
) -> Option<Box<dyn AgentRunner>> {
    match agent_type {
        AgentType::Smart => Some(Box::new(SmartRunner::new(provider.clone()))),
        AgentType::Autonomous => Some(Box::new(AutonomousRunner::new(
            provider.clone(),
            tools.clone(),
        ))),
        AgentType::Build => Some(Box::new(BuildRunner::new(tools.clone(), provider.clone()))),
        AgentType::Coordinator => Some(Box::new(CoordinatorRunner::new(provider.clone()))),
        AgentType::Custom => None,
    }
}
