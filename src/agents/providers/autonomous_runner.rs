//! Autonomous agent: a provider/tool loop
//!
//! Each step asks the provider for the next action. A reply containing a
//! fenced JSON block `{"tool": "...", "args": {...}}` is a tool call; the
//! tool output is appended to the transcript and the loop continues. Any
//! other reply is the final answer.

use crate::agents::runner::{AgentRunner, RunContext, ToolRegistry, WorkProvider};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, OnceLock};

pub const DEFAULT_MAX_STEPS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

fn json_block_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```json\s*\n([\s\S]*?)```").ok())
        .as_ref()
}

/// Extract the first tool call from a provider reply
pub fn parse_tool_call(response: &str) -> Option<ToolCall> {
    let trimmed = response.trim();
    if trimmed.starts_with('{') {
        if let Ok(call) = serde_json::from_str::<ToolCall>(trimmed) {
            return Some(call);
        }
    }

    json_block_regex()?
        .captures_iter(response)
        .filter_map(|cap| cap.get(1))
        .find_map(|m| serde_json::from_str::<ToolCall>(m.as_str().trim()).ok())
}

pub struct AutonomousRunner {
    provider: Arc<dyn WorkProvider>,
    tools: Arc<dyn ToolRegistry>,
    max_steps: u32,
}

impl AutonomousRunner {
    pub fn new(provider: Arc<dyn WorkProvider>, tools: Arc<dyn ToolRegistry>) -> Self {
        Self {
            provider,
            tools,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    fn build_prompt(&self, transcript: &str) -> String {
        let tools = self.tools.tool_names();
        let tool_line = if tools.is_empty() {
            String::new()
        } else {
            format!("Available tools: {}\n", tools.join(", "))
        };
        format!(
            "{}To call a tool reply with a ```json block {{\"tool\": name, \"args\": {{...}}}}. \
             Reply in plain text when the task is done.\n\n{}",
            tool_line, transcript
        )
    }
}

/// Progress after `step` of `max_steps`, kept below 100 until the final answer
fn step_percent(step: u32, max_steps: u32) -> u8 {
    let percent = u64::from(step) * 100 / (u64::from(max_steps) + 1);
    u8::try_from(percent.min(99)).unwrap_or(99)
}

impl AgentRunner for AutonomousRunner {
    fn run(&self, task: &str, ctx: &RunContext) -> Result<String, String> {
        let mut transcript = format!("Task: {}\n", task);

        for step in 1..=self.max_steps {
            let response = self.provider.complete(&self.build_prompt(&transcript))?;

            let Some(call) = parse_tool_call(&response) else {
                ctx.report_progress(100, "Done");
                return Ok(response.trim().to_string());
            };

            let output = if self.tools.has_tool(&call.tool) {
                log::debug!(
                    "[{}] step {} calling tool '{}'",
                    ctx.agent_name,
                    step,
                    call.tool
                );
                self.tools
                    .invoke(&call.tool, &call.args)
                    .unwrap_or_else(|e| format!("error: {}", e))
            } else {
                format!("error: tool '{}' is not available", call.tool)
            };
            transcript.push_str(&format!("Tool {} returned: {}\n", call.tool, output));

            ctx.report_progress(
                step_percent(step, self.max_steps),
                &format!("Called {}", call.tool),
            );
        }

        Err(format!("No final answer after {} steps", self.max_steps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::providers::test_support::{RecordingTools, ScriptedProvider};
    use std::sync::Mutex;

    #[test]
    fn test_parse_tool_call_fenced() {
        let reply = "I'll read it.\n```json\n{\"tool\": \"read_file\", \"args\": {\"path\": \"a.rs\"}}\n```";
        let call = parse_tool_call(reply).unwrap();
        assert_eq!(call.tool, "read_file");
        assert_eq!(call.args["path"], "a.rs");
    }

    #[test]
    fn test_parse_tool_call_bare_object() {
        let call = parse_tool_call("{\"tool\": \"ls\"}").unwrap();
        assert_eq!(call.tool, "ls");
        assert!(call.args.is_null());
    }

    #[test]
    fn test_parse_tool_call_plain_text() {
        assert!(parse_tool_call("All done, the file is fixed.").is_none());
        assert!(parse_tool_call("```json\n{\"other\": 1}\n```").is_none());
    }

    #[test]
    fn test_loop_calls_tools_then_answers() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok("```json\n{\"tool\": \"run\", \"args\": {\"cmd\": \"make\"}}\n```"),
            Ok("Finished: make succeeded"),
        ]));
        let tools = Arc::new(RecordingTools::new(vec!["run"], 0));
        let runner = AutonomousRunner::new(provider.clone(), tools.clone());

        let progress = Arc::new(Mutex::new(Vec::new()));
        let sink = progress.clone();
        let ctx = RunContext::new("1", "worker").with_progress(Arc::new(move |p: u8, _m: &str| {
            sink.lock().unwrap().push(p);
        }));

        let output = runner.run("build the project", &ctx).unwrap();
        assert_eq!(output, "Finished: make succeeded");

        let calls = tools.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1["cmd"], "make");

        // Second prompt carries the tool output
        let prompts = provider.prompts.lock().unwrap();
        assert!(prompts[1].contains("Tool run returned: run ok"));
        assert_eq!(*progress.lock().unwrap().last().unwrap(), 100);
    }

    #[test]
    fn test_unknown_tool_is_reported_back() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok("{\"tool\": \"rm_rf\"}"),
            Ok("ok, giving up on that"),
        ]));
        let tools = Arc::new(RecordingTools::new(vec![], 0));
        let runner = AutonomousRunner::new(provider.clone(), tools.clone());

        runner.run("cleanup", &RunContext::new("1", "w")).unwrap();
        assert!(tools.calls.lock().unwrap().is_empty());
        assert!(provider.prompts.lock().unwrap()[1].contains("not available"));
    }

    #[test]
    fn test_step_percent_handles_large_limits() {
        assert_eq!(step_percent(1, 1), 50);
        assert_eq!(step_percent(2, 3), 50);
        assert_eq!(step_percent(u32::MAX, u32::MAX), 99);
        assert_eq!(step_percent(1, u32::MAX), 0);
    }

    #[test]
    fn test_step_limit() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok("{\"tool\": \"run\"}"),
            Ok("{\"tool\": \"run\"}"),
        ]));
        let tools = Arc::new(RecordingTools::new(vec!["run"], 0));
        let runner = AutonomousRunner::new(provider, tools).with_max_steps(2);

        let err = runner.run("loop", &RunContext::new("1", "w")).unwrap_err();
        assert!(err.contains("2 steps"));
    }
}
