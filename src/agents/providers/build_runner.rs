// Build agent: runs the `build` tool, asking the provider for a fix between attempts

use crate::agents::runner::{AgentRunner, RunContext, ToolRegistry, WorkProvider};
use serde_json::json;
use std::sync::Arc;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const BUILD_TOOL: &str = "build";
const FIX_TOOL: &str = "apply_fix";

pub struct BuildRunner {
    tools: Arc<dyn ToolRegistry>,
    provider: Arc<dyn WorkProvider>,
    max_attempts: u32,
}

impl BuildRunner {
    pub fn new(tools: Arc<dyn ToolRegistry>, provider: Arc<dyn WorkProvider>) -> Self {
        Self {
            tools,
            provider,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    fn try_fix(&self, task: &str, error: &str, ctx: &RunContext) {
        if !self.tools.has_tool(FIX_TOOL) {
            return;
        }

        let prompt = format!(
            "The build for '{}' failed with:\n{}\n\nSuggest a fix.",
            task, error
        );
        match self.provider.complete(&prompt) {
            Ok(fix) => {
                let args = json!({ "error": error, "fix": fix });
                if let Err(e) = self.tools.invoke(FIX_TOOL, &args) {
                    log::warn!("[{}] Failed to apply fix: {}", ctx.agent_name, e);
                }
            }
            Err(e) => log::warn!("[{}] No fix suggestion: {}", ctx.agent_name, e),
        }
    }
}

impl AgentRunner for BuildRunner {
    fn run(&self, task: &str, ctx: &RunContext) -> Result<String, String> {
        if !self.tools.has_tool(BUILD_TOOL) {
            return Err("No build tool registered".to_string());
        }

        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            let percent = ((attempt - 1) * 100 / self.max_attempts) as u8;
            ctx.report_progress(percent, &format!("Build attempt {}", attempt));

            match self
                .tools
                .invoke(BUILD_TOOL, &json!({ "target": task, "attempt": attempt }))
            {
                Ok(output) => {
                    ctx.report_progress(100, "Build succeeded");
                    return Ok(output);
                }
                Err(e) => {
                    log::debug!(
                        "[{}] Build attempt {}/{} failed: {}",
                        ctx.agent_name,
                        attempt,
                        self.max_attempts,
                        e
                    );
                    last_error = e;
                    if attempt < self.max_attempts {
                        self.try_fix(task, &last_error, ctx);
                    }
                }
            }
        }

        Err(format!(
            "Build failed after {} attempts: {}",
            self.max_attempts, last_error
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::providers::test_support::{RecordingTools, ScriptedProvider};

    #[test]
    fn test_build_succeeds_after_fix() {
        let tools = Arc::new(RecordingTools::new(vec!["build", "apply_fix"], 1));
        let provider = Arc::new(ScriptedProvider::new(vec![Ok("add the missing import")]));
        let runner = BuildRunner::new(tools.clone(), provider);

        let output = runner.run("crate", &RunContext::new("1", "builder")).unwrap();
        assert_eq!(output, "build ok");

        let calls = tools.calls.lock().unwrap();
        let names: Vec<&str> = calls.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["build", "apply_fix", "build"]);
        assert_eq!(calls[1].1["fix"], "add the missing import");
    }

    #[test]
    fn test_build_gives_up() {
        let tools = Arc::new(RecordingTools::new(vec!["build"], 10));
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let runner = BuildRunner::new(tools.clone(), provider).with_max_attempts(2);

        let err = runner.run("crate", &RunContext::new("1", "b")).unwrap_err();
        assert!(err.starts_with("Build failed after 2 attempts"));
        assert_eq!(tools.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_build_requires_tool() {
        let tools = Arc::new(RecordingTools::new(vec![], 0));
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let runner = BuildRunner::new(tools, provider);
        assert!(runner.run("crate", &RunContext::new("1", "b")).is_err());
    }
}
