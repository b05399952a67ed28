//! Runtime configuration
//!
//! Reads and writes a TOML file describing queue, registry, bus, state and
//! coordinator settings. Every field has a default, so partial files work.

use crate::coordinator::{CoordinatorConfig, ResolutionStrategy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default file name when a directory is given to `ConfigManager::in_dir`
pub const CONFIG_FILE_NAME: &str = "agent-coord.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueSettings {
    pub initial_capacity: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            initial_capacity: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistrySettings {
    pub max_concurrent: usize,
    pub default_timeout_secs: u64,
    /// Threads in the shared worker pool
    pub worker_threads: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            default_timeout_secs: 300,
            worker_threads: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BusSettings {
    pub request_poll_interval_ms: u64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            request_poll_interval_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StateSettings {
    /// Shared state is loaded from and saved to this file when set
    pub persistence_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinatorSettings {
    pub strategy: ResolutionStrategy,
    pub max_concurrent: usize,
    pub task_timeout_secs: u64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            strategy: ResolutionStrategy::PromptUser,
            max_concurrent: 8,
            task_timeout_secs: 600,
        }
    }
}

impl CoordinatorSettings {
    /// Coordinator config without a prompt callback
    pub fn to_coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            strategy: self.strategy,
            max_concurrent: self.max_concurrent,
            task_timeout: Duration::from_secs(self.task_timeout_secs),
            prompt_user: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub queue: QueueSettings,
    pub registry: RegistrySettings,
    pub bus: BusSettings,
    pub state: StateSettings,
    pub coordinator: CoordinatorSettings,
}

impl RuntimeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("Failed to parse config: {}", e))
    }

    pub fn to_toml_string(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| format!("Failed to serialize config: {}", e))
    }
}

/// Configuration file manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    /// Manager for `agent-coord.toml` inside `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(CONFIG_FILE_NAME))
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }

    /// Read config from file, returning defaults if not found
    pub fn read(&self) -> Result<RuntimeConfig, String> {
        if !self.config_path.exists() {
            return Ok(RuntimeConfig::default());
        }

        let content = std::fs::read_to_string(&self.config_path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        RuntimeConfig::from_toml_str(&content)
    }

    pub fn write(&self, config: &RuntimeConfig) -> Result<(), String> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        let content = config.to_toml_string()?;
        std::fs::write(&self.config_path, content)
            .map_err(|e| format!("Failed to write config file: {}", e))
    }

    /// Write defaults if the file doesn't exist yet
    pub fn initialize(&self) -> Result<RuntimeConfig, String> {
        if self.exists() {
            return self.read();
        }

        let config = RuntimeConfig::default();
        self.write(&config)?;
        log::info!("Wrote default config to {:?}", self.config_path);
        Ok(config)
    }

    pub fn update<F>(&self, updater: F) -> Result<RuntimeConfig, String>
    where
        F: FnOnce(&mut RuntimeConfig),
    {
        let mut config = self.read()?;
        updater(&mut config);
        self.write(&config)?;
        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }
}
