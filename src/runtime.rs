//! Runtime wiring
//!
//! Builds every component from a `RuntimeConfig` and tears them down in
//! order: stop intake (queue, bus), stop agents, stop the pool, persist state.
//! `run_until_shutdown` parks the caller until a signal or
//! `ShutdownState::request_shutdown` asks for that teardown.

use crate::agents::{AgentRegistry, ThreadPool, ToolRegistry, WorkProvider, WorkerPool};
use crate::config::{ConfigManager, RuntimeConfig};
use crate::coordinator::{AgentCoordinator, PromptCallback};
use crate::message_bus::MessageBus;
use crate::shared_state::SharedState;
use crate::shutdown::{
    register_signal_handlers, ShutdownHandler, ShutdownResult, ShutdownState,
};
use crate::task_queue::TaskQueue;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// External collaborators plugged into the runtime
#[derive(Default, Clone)]
pub struct Collaborators {
    pub provider: Option<Arc<dyn WorkProvider>>,
    pub tools: Option<Arc<dyn ToolRegistry>>,
    pub prompt_user: Option<PromptCallback>,
}

pub struct Runtime {
    config: RuntimeConfig,
    pool: Arc<WorkerPool>,
    queue: Arc<TaskQueue>,
    bus: Arc<MessageBus>,
    shared: Arc<SharedState>,
    registry: Arc<AgentRegistry>,
    coordinator: Arc<AgentCoordinator>,
    shutdown_state: ShutdownState,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_collaborators(config, Collaborators::default())
    }

    /// Read the TOML file at `path` (defaults if missing) and build from it
    pub fn from_config_file(path: &Path) -> anyhow::Result<Self> {
        let config = ConfigManager::new(path)
            .read()
            .map_err(|e| anyhow::anyhow!("{} ({})", e, path.display()))?;
        Ok(Self::new(config))
    }

    pub fn with_collaborators(config: RuntimeConfig, collaborators: Collaborators) -> Self {
        let pool = Arc::new(WorkerPool::new(config.registry.worker_threads));
        let queue = Arc::new(TaskQueue::with_capacity(config.queue.initial_capacity));
        let bus = Arc::new(MessageBus::with_poll_interval(Duration::from_millis(
            config.bus.request_poll_interval_ms,
        )));

        let shared = match &config.state.persistence_path {
            Some(path) => {
                let state = SharedState::with_persistence(path);
                match state.load() {
                    Ok(count) => log::info!("Loaded {} state entries from {}", count, path.display()),
                    Err(e) => log::warn!("Starting with empty state: {}", e),
                }
                state
            }
            None => SharedState::new(),
        };
        let shared = Arc::new(shared);

        let mut registry = AgentRegistry::new(pool.clone() as Arc<dyn ThreadPool>, shared.clone())
            .with_max_concurrent(config.registry.max_concurrent)
            .with_default_timeout(Duration::from_secs(config.registry.default_timeout_secs));
        if let Some(provider) = collaborators.provider {
            registry = registry.with_provider(provider);
        }
        if let Some(tools) = collaborators.tools {
            registry = registry.with_tools(tools);
        }
        let registry = Arc::new(registry);

        let mut coordinator_config = config.coordinator.to_coordinator_config();
        coordinator_config.prompt_user = collaborators.prompt_user;
        let coordinator = Arc::new(AgentCoordinator::new(
            registry.clone(),
            bus.clone(),
            shared.clone(),
            queue.clone(),
            coordinator_config,
        ));

        log::info!(
            "Runtime ready: {} worker threads, strategy {:?}",
            pool.size(),
            config.coordinator.strategy
        );

        Self {
            config,
            pool,
            queue,
            bus,
            shared,
            registry,
            coordinator,
            shutdown_state: ShutdownState::new(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<AgentCoordinator> {
        &self.coordinator
    }

    /// Flag shared with signal handlers; clone it to request shutdown from elsewhere
    pub fn shutdown_state(&self) -> &ShutdownState {
        &self.shutdown_state
    }

    /// Trap SIGINT, SIGTERM and SIGHUP (Ctrl+C on Windows) as shutdown requests
    pub fn install_signal_handlers(&self) -> anyhow::Result<()> {
        register_signal_handlers(self.shutdown_state.clone())
    }

    /// Block until shutdown is requested, then tear down and report.
    ///
    /// Returns `None` if `timeout` passes first; the runtime is left running.
    pub fn run_until_shutdown(
        &self,
        timeout: Option<Duration>,
    ) -> anyhow::Result<Option<ShutdownResult>> {
        if !self
            .shutdown_state
            .wait_for_request(timeout, SHUTDOWN_POLL_INTERVAL)
        {
            return Ok(None);
        }
        ShutdownHandler::with_state(self.shutdown_state.clone())
            .handle_shutdown(|| Ok(self.shutdown()))
            .map(Some)
    }

    /// Shut everything down. Safe to call more than once.
    pub fn shutdown(&self) -> ShutdownResult {
        let mut result = ShutdownResult::new();

        self.queue.shutdown();
        result.tasks_dropped = self.queue.clear();
        self.bus.shutdown();

        result.agents_stopped = self.registry.terminate_all();
        // Running jobs are not interrupted; give them the registry timeout
        if !self.registry.wait_all(Some(self.registry.default_timeout())) {
            result
                .errors
                .push("Timed out waiting for agents to finish".to_string());
        }
        self.pool.shutdown();

        if self.shared.persistence_path().is_some() {
            match self.shared.save() {
                Ok(()) => result.state_saved = true,
                Err(e) => result.errors.push(format!("Failed to save state: {}", e)),
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentType, Task};
    use tempfile::TempDir;

    #[test]
    fn test_runtime_from_defaults() {
        let runtime = Runtime::new(RuntimeConfig::default());
        assert_eq!(runtime.registry().max_concurrent(), 8);
        assert!(runtime.queue().is_empty());
        assert!(runtime.shared_state().persistence_path().is_none());
    }

    #[test]
    fn test_runtime_shutdown_reports_cleanup() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let agent = runtime.registry().create("thinker", AgentType::Smart).unwrap();
        agent.start().unwrap();
        runtime.queue().push(Task::new("left over")).unwrap();

        let result = runtime.shutdown();
        assert_eq!(result.agents_stopped, 1);
        assert_eq!(result.tasks_dropped, 1);
        assert!(!result.state_saved);
        assert!(result.is_clean());
        assert!(runtime.queue().is_shutdown());
        assert!(runtime.bus().is_shutdown());

        // Second call finds nothing left to do
        let again = runtime.shutdown();
        assert_eq!(again.agents_stopped, 0);
    }

    #[test]
    fn test_run_until_shutdown_on_request() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let agent = runtime.registry().create("idler", AgentType::Smart).unwrap();
        agent.start().unwrap();

        let state = runtime.shutdown_state().clone();
        let requester = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            state.request_shutdown();
        });

        let result = runtime
            .run_until_shutdown(Some(Duration::from_secs(5)))
            .unwrap()
            .unwrap();
        requester.join().unwrap();

        assert_eq!(result.agents_stopped, 1);
        assert!(result.is_clean());
        assert!(runtime.shutdown_state().is_cleanup_complete());
        assert!(runtime.queue().is_shutdown());
    }

    #[test]
    fn test_run_until_shutdown_times_out() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let outcome = runtime
            .run_until_shutdown(Some(Duration::from_millis(20)))
            .unwrap();
        assert!(outcome.is_none());
        assert!(!runtime.queue().is_shutdown());
        assert!(!runtime.shutdown_state().is_cleanup_complete());
    }

    #[cfg(unix)]
    #[test]
    fn test_install_signal_handlers() {
        let runtime = Runtime::new(RuntimeConfig::default());
        assert!(runtime.install_signal_handlers().is_ok());
        assert!(!runtime.shutdown_state().is_shutdown_requested());
    }

    #[test]
    fn test_runtime_persists_state_across_restarts() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = RuntimeConfig::default();
        config.state.persistence_path = Some(temp_dir.path().join("state.json"));

        let runtime = Runtime::new(config.clone());
        runtime.shared_state().set("build.status", "green").unwrap();
        assert!(runtime.shutdown().state_saved);
        drop(runtime);

        let restarted = Runtime::new(config);
        assert_eq!(
            restarted.shared_state().get("build.status").as_deref(),
            Some("green")
        );
    }

    #[test]
    fn test_runtime_from_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("rt.toml");
        std::fs::write(&path, "[registry]\nmax_concurrent = 3\n").unwrap();

        let runtime = Runtime::from_config_file(&path).unwrap();
        assert_eq!(runtime.registry().max_concurrent(), 3);

        std::fs::write(&path, "registry = 5").unwrap();
        assert!(Runtime::from_config_file(&path).is_err());
    }
}
