// Coordinator agent: breaks a task into an ordered plan

use crate::agents::runner::{AgentRunner, RunContext, WorkProvider};
use std::sync::Arc;

/// Pull list items ("- x", "* x", "1. x", "2) x") out of free text
pub fn parse_plan(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            let item = if let Some(rest) = line.strip_prefix("- ").or(line.strip_prefix("* ")) {
                rest
            } else {
                let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
                if digits == 0 {
                    return None;
                }
                line[digits..]
                    .strip_prefix(". ")
                    .or(line[digits..].strip_prefix(") "))?
            };
            let item = item.trim();
            (!item.is_empty()).then(|| item.to_string())
        })
        .collect()
}

pub struct CoordinatorRunner {
    provider: Arc<dyn WorkProvider>,
}

impl CoordinatorRunner {
    pub fn new(provider: Arc<dyn WorkProvider>) -> Self {
        Self { provider }
    }
}

impl AgentRunner for CoordinatorRunner {
    fn run(&self, task: &str, ctx: &RunContext) -> Result<String, String> {
        ctx.report_progress(0, "Planning");

        let prompt = format!(
            "Break the following task into independent steps, one per line as a numbered list.\n\nTask: {}",
            task
        );
        let response = self.provider.complete(&prompt)?;
        let steps = parse_plan(&response);

        ctx.report_progress(100, "Plan ready");
        if steps.is_empty() {
            return Ok(response.trim().to_string());
        }

        let mut plan = format!("Planned {} steps:", steps.len());
        for (i, step) in steps.iter().enumerate() {
            plan.push_str(&format!("\n{}. {}", i + 1, step));
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::providers::test_support::ScriptedProvider;

    #[test]
    fn test_parse_plan() {
        let text = "Here is the plan:\n1. Fetch deps\n2) Build\n- Test\n* Ship\n10. Celebrate\nthanks";
        assert_eq!(
            parse_plan(text),
            vec!["Fetch deps", "Build", "Test", "Ship", "Celebrate"]
        );
        assert!(parse_plan("no list here").is_empty());
    }

    #[test]
    fn test_coordinator_runner_normalizes_plan() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok("- lint\n- test")]));
        let runner = CoordinatorRunner::new(provider);
        let plan = runner.run("release", &RunContext::new("1", "lead")).unwrap();
        assert_eq!(plan, "Planned 2 steps:\n1. lint\n2. test");
    }
}
