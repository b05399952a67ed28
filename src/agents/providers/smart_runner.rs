// Smart agent: single-shot analysis and reasoning through the work provider

use crate::agents::runner::{AgentRunner, RunContext, WorkProvider};
use std::sync::Arc;

pub struct SmartRunner {
    provider: Arc<dyn WorkProvider>,
}

impl SmartRunner {
    pub fn new(provider: Arc<dyn WorkProvider>) -> Self {
        Self { provider }
    }

    fn build_prompt(task: &str, ctx: &RunContext) -> String {
        format!(
            "You are {}, an analysis agent. Investigate the task below, explain the cause \
             of any problem you find and describe the fix.\n\nTask: {}",
            ctx.agent_name, task
        )
    }
}

impl AgentRunner for SmartRunner {
    fn run(&self, task: &str, ctx: &RunContext) -> Result<String, String> {
        ctx.report_progress(0, "Analyzing");

        let response = self.provider.complete(&Self::build_prompt(task, ctx))?;
        let response = response.trim();
        if response.is_empty() {
            return Err("Provider returned an empty response".to_string());
        }

        ctx.report_progress(100, "Analysis complete");
        Ok(response.to_string())
    }
}
