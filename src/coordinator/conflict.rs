// Conflict records and resolution policy

use crate::utils::generate_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    Resource,
    Task,
    State,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    Agent1Wins,
    Agent2Wins,
    Sequential,
    CancelBoth,
}

impl ConflictResolution {
    /// Options offered to the user, in index order
    pub const OPTIONS: [&'static str; 4] = [
        "Agent 1 wins",
        "Agent 2 wins",
        "Both proceed sequentially",
        "Cancel both",
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(ConflictResolution::Agent1Wins),
            1 => Some(ConflictResolution::Agent2Wins),
            2 => Some(ConflictResolution::Sequential),
            3 => Some(ConflictResolution::CancelBoth),
            _ => None,
        }
    }
}

/// How the coordinator settles a conflict
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    #[default]
    PromptUser,
    FirstWins,
    SecondWins,
    Sequential,
    CancelBoth,
}

impl std::str::FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "prompt_user" | "prompt" => Ok(ResolutionStrategy::PromptUser),
            "first_wins" => Ok(ResolutionStrategy::FirstWins),
            "second_wins" => Ok(ResolutionStrategy::SecondWins),
            "sequential" => Ok(ResolutionStrategy::Sequential),
            "cancel_both" => Ok(ResolutionStrategy::CancelBoth),
            _ => Err(format!("Unknown resolution strategy: '{}'", s)),
        }
    }
}

/// Contention between two agents. `agent1` holds the resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConflict {
    pub id: String,
    pub conflict_type: ConflictType,
    pub agent1_id: String,
    pub agent2_id: String,
    pub resource_id: String,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<ConflictResolution>,
}

impl AgentConflict {
    pub fn new(
        conflict_type: ConflictType,
        agent1_id: &str,
        agent2_id: &str,
        resource_id: &str,
        description: String,
    ) -> Self {
        Self {
            id: generate_id(),
            conflict_type,
            agent1_id: agent1_id.to_string(),
            agent2_id: agent2_id.to_string(),
            resource_id: resource_id.to_string(),
            description,
            detected_at: Utc::now(),
            resolved_at: None,
            resolution: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// Human-readable prompt shown when asking how to resolve
    pub fn prompt_message(&self) -> String {
        format!(
            "Conflict over '{}': agent '{}' holds it and agent '{}' wants it ({}). How should this be resolved?",
            self.resource_id, self.agent1_id, self.agent2_id, self.description
        )
    }
}

/// `(conflict, message, options) -> selected index`
pub type PromptCallback = Arc<dyn Fn(&AgentConflict, &str, &[&str]) -> usize + Send + Sync>;

#[derive(Clone)]
pub struct CoordinatorConfig {
    pub strategy: ResolutionStrategy,
    pub max_concurrent: usize,
    pub task_timeout: Duration,
    pub prompt_user: Option<PromptCallback>,
}

impl CoordinatorConfig {
    pub fn with_strategy(mut self, strategy: ResolutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_prompt<F>(mut self, prompt: F) -> Self
    where
        F: Fn(&AgentConflict, &str, &[&str]) -> usize + Send + Sync + 'static,
    {
        self.prompt_user = Some(Arc::new(prompt));
        self
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            strategy: ResolutionStrategy::PromptUser,
            max_concurrent: 8,
            task_timeout: Duration::from_secs(600),
            prompt_user: None,
        }
    }
}

impl std::fmt::Debug for CoordinatorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorConfig")
            .field("strategy", &self.strategy)
            .field("max_concurrent", &self.max_concurrent)
            .field("task_timeout", &self.task_timeout)
            .field("prompt_user", &self.prompt_user.is_some())
            .finish()
    }
}
