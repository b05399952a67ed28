// Closure-backed runner for custom agents

use crate::agents::runner::{AgentRunner, RunContext};

pub struct FnRunner<F> {
    f: F,
}

impl<F> FnRunner<F>
where
    F: Fn(&str, &RunContext) -> Result<String, String> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> AgentRunner for FnRunner<F>
where
    F: Fn(&str, &RunContext) -> Result<String, String> + Send + Sync,
{
    fn run(&self, task: &str, ctx: &RunContext) -> Result<String, String> {
        (self.f)(task, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_runner() {
        let runner = FnRunner::new(|task: &str, ctx: &RunContext| {
            Ok(format!("{} did {}", ctx.agent_name, task))
        });
        assert_eq!(
            runner.run("work", &RunContext::new("1", "custom")).unwrap(),
            "custom did work"
        );
    }
}
