use crate::agents::instance::{wait_for_all, AgentError, AgentInstance};
use crate::agents::pool::ThreadPool;
use crate::agents::providers::get_runner;
use crate::agents::runner::{AgentRunner, NoProvider, NoTools, ToolRegistry, WorkProvider};
use crate::models::{AgentState, AgentType, Capabilities};
use crate::shared_state::SharedState;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

pub const DEFAULT_MAX_CONCURRENT: usize = 8;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Owns every agent. Parents refer to children weakly, so removing an agent
/// here is what actually drops it.
pub struct AgentRegistry {
    agents: RwLock<Vec<Arc<AgentInstance>>>,
    pool: Arc<dyn ThreadPool>,
    shared: Arc<SharedState>,
    provider: Arc<dyn WorkProvider>,
    tools: Arc<dyn ToolRegistry>,
    max_concurrent: usize,
    default_timeout: Duration,
}

impl AgentRegistry {
    /// Create an empty registry whose agents run on `pool` and publish into `shared`
    pub fn new(pool: Arc<dyn ThreadPool>, shared: Arc<SharedState>) -> Self {
        Self {
            agents: RwLock::new(Vec::new()),
            pool,
            shared,
            provider: Arc::new(NoProvider),
            tools: Arc::new(NoTools),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn WorkProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    /// Advisory cap; exceeding it only logs a warning
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<AgentInstance>>> {
        self.agents.read().unwrap_or_else(|poisoned| {
            log::warn!("Agent registry lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<AgentInstance>>> {
        self.agents.write().unwrap_or_else(|poisoned| {
            log::warn!("Agent registry lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn insert(
        &self,
        name: &str,
        agent_type: AgentType,
        capabilities: Capabilities,
        runner: Box<dyn AgentRunner>,
        parent_id: Option<String>,
    ) -> Result<Arc<AgentInstance>, AgentError> {
        let mut agents = self.write();
        if agents.iter().any(|a| a.name() == name) {
            return Err(AgentError::DuplicateName(name.to_string()));
        }

        let live = agents.iter().filter(|a| !a.is_finished()).count();
        if live >= self.max_concurrent {
            log::warn!(
                "Creating agent '{}' with {} live agents (limit {})",
                name,
                live,
                self.max_concurrent
            );
        }

        let agent = Arc::new(AgentInstance::new(
            name,
            agent_type,
            capabilities,
            runner,
            parent_id,
            self.pool.clone(),
            self.shared.clone(),
        ));
        agents.push(agent.clone());
        log::info!("Created {} agent '{}' ({})", agent_type, name, agent.id());
        Ok(agent)
    }

    /// Create an agent of a built-in type with its default capabilities
    pub fn create(&self, name: &str, agent_type: AgentType) -> Result<Arc<AgentInstance>, AgentError> {
        let runner = get_runner(agent_type, &self.provider, &self.tools)
            .ok_or(AgentError::UnsupportedType(agent_type))?;
        self.insert(
            name,
            agent_type,
            agent_type.default_capabilities(),
            runner,
            None,
        )
    }

    /// Create a custom agent around a caller-supplied runner
    pub fn create_custom(
        &self,
        name: &str,
        runner: Box<dyn AgentRunner>,
        capabilities: Capabilities,
    ) -> Result<Arc<AgentInstance>, AgentError> {
        self.insert(name, AgentType::Custom, capabilities, runner, None)
    }

    /// Create a child of `parent_id`. The parent needs the spawn capability.
    pub fn spawn_child(
        &self,
        parent_id: &str,
        name: &str,
        agent_type: AgentType,
    ) -> Result<Arc<AgentInstance>, AgentError> {
        let parent = self
            .get(parent_id)
            .ok_or_else(|| AgentError::NotFound(parent_id.to_string()))?;
        if !parent.capabilities().contains(Capabilities::SPAWN) {
            return Err(AgentError::MissingCapability {
                name: parent.name().to_string(),
                required: Capabilities::SPAWN,
            });
        }

        let runner = get_runner(agent_type, &self.provider, &self.tools)
            .ok_or(AgentError::UnsupportedType(agent_type))?;
        let child = self.insert(
            name,
            agent_type,
            agent_type.default_capabilities(),
            runner,
            Some(parent.id().to_string()),
        )?;
        parent.add_child(&child);
        log::debug!("Agent '{}' spawned child '{}'", parent.name(), name);
        Ok(child)
    }

    /// Remove an agent, terminating it (and its children) first
    pub fn remove(&self, agent_id: &str) -> Option<Arc<AgentInstance>> {
        let agent = {
            let mut agents = self.write();
            let index = agents.iter().position(|a| a.id() == agent_id)?;
            agents.remove(index)
        };
        agent.terminate();
        log::info!("Removed agent '{}'", agent.name());
        Some(agent)
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentInstance>> {
        self.read().iter().find(|a| a.id() == agent_id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<AgentInstance>> {
        self.read().iter().find(|a| a.name() == name).cloned()
    }

    /// All agents in creation order
    pub fn list(&self) -> Vec<Arc<AgentInstance>> {
        self.read().clone()
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    pub fn count_by_state(&self, state: AgentState) -> usize {
        self.list().iter().filter(|a| a.state() == state).count()
    }

    /// Agents ready to take a task, in creation order
    pub fn idle_agents(&self) -> Vec<Arc<AgentInstance>> {
        self.list()
            .into_iter()
            .filter(|a| a.is_available())
            .collect()
    }

    pub fn terminate(&self, agent_id: &str) -> Result<bool, AgentError> {
        let agent = self
            .get(agent_id)
            .ok_or_else(|| AgentError::NotFound(agent_id.to_string()))?;
        Ok(agent.terminate())
    }

    /// Terminate every live agent, returning how many were live
    pub fn terminate_all(&self) -> usize {
        let live: Vec<Arc<AgentInstance>> = self
            .list()
            .into_iter()
            .filter(|a| !a.is_finished())
            .collect();
        for agent in &live {
            agent.terminate();
        }
        log::info!("Terminated {} agents", live.len());
        live.len()
    }

    /// Wait until no agent has work in flight. False on timeout.
    pub fn wait_all(&self, timeout: Option<Duration>) -> bool {
        wait_for_all(&self.list(), timeout)
    }
}
