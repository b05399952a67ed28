// Runner trait and the collaborators runners delegate to

use serde_json::Value;
use std::sync::Arc;

/// Progress sink handed to a runner for the duration of one run
pub type ProgressSink = Arc<dyn Fn(u8, &str) + Send + Sync>;

/// Per-run context passed to an [`AgentRunner`]
#[derive(Clone)]
pub struct RunContext {
    pub agent_id: String,
    pub agent_name: String,
    progress: Option<ProgressSink>,
}

impl RunContext {
    pub fn new(agent_id: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Report partial progress. Percent is clamped to 100.
    pub fn report_progress(&self, percent: u8, message: &str) {
        if let Some(progress) = &self.progress {
            progress(percent.min(100), message);
        }
    }
}

/// The work an agent actually performs. The registry treats it as opaque.
pub trait AgentRunner: Send + Sync {
    /// Perform `task` and return its output, or an error message
    fn run(&self, task: &str, ctx: &RunContext) -> Result<String, String>;

    /// Release any resources held by the runner
    fn shutdown(&self) {}
}

/// Text-completion backend used by the reasoning runners
pub trait WorkProvider: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String, String>;
}

/// Named tools an agent may call with JSON arguments
pub trait ToolRegistry: Send + Sync {
    fn invoke(&self, tool: &str, args: &Value) -> Result<String, String>;

    fn has_tool(&self, tool: &str) -> bool;

    fn tool_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Provider used when none is configured; every call fails
pub struct NoProvider;

impl WorkProvider for NoProvider {
    fn complete(&self, _prompt: &str) -> Result<String, String> {
        Err("No work provider configured".to_string())
    }
}

/// Tool registry with no tools
pub struct NoTools;

impl ToolRegistry for NoTools {
    fn invoke(&self, tool: &str, _args: &Value) -> Result<String, String> {
        Err(format!("Unknown tool: {}", tool))
    }

    fn has_tool(&self, _tool: &str) -> bool {
        false
    }
}
