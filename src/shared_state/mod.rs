//! Shared key/value state with advisory per-key locks
//!
//! Keys are case-sensitive. A "lock" here is a non-blocking ownership marker:
//! `lock`/`trylock` succeed immediately for a free key or the current holder
//! and fail immediately otherwise. While a key is locked only its holder may
//! `set_as`/`delete_as` it.
//!
//! The table can be persisted as `{"entries": {"<key>": "<value>"}}`. Locks
//! and timestamps are not persisted.

use crate::file_storage::{atomic_write, read_json, with_file_lock};
use crate::utils::lock_mutex_recover;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("Key '{key}' is locked by '{holder}'")]
    Locked { key: String, holder: String },

    #[error("Key '{0}' not found")]
    NotFound(String),

    #[error("No persistence path configured")]
    NoPersistencePath,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Malformed state file: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEntry {
    pub key: String,
    /// `None` for an entry that exists only because it was locked
    pub value: Option<String>,
    pub locked_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
}

impl StateEntry {
    fn new(key: &str) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            value: None,
            locked_by: None,
            created_at: now,
            updated_at: now,
            locked_at: None,
        }
    }
}

/// On-disk format
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    entries: BTreeMap<String, String>,
}

#[derive(Default)]
struct StateTable {
    entries: HashMap<String, StateEntry>,
    dirty: bool,
}

impl StateTable {
    /// Fail unless the key is unlocked or held by `agent_id`
    fn check_writable(&self, key: &str, agent_id: Option<&str>) -> Result<(), StateError> {
        match self.entries.get(key).and_then(|e| e.locked_by.as_deref()) {
            Some(holder) if Some(holder) != agent_id => Err(StateError::Locked {
                key: key.to_string(),
                holder: holder.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn set(&mut self, key: &str, value: &str, agent_id: Option<&str>) -> Result<(), StateError> {
        self.check_writable(key, agent_id)?;
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StateEntry::new(key));
        entry.value = Some(value.to_string());
        entry.updated_at = Utc::now();
        self.dirty = true;
        Ok(())
    }

    fn delete(&mut self, key: &str, agent_id: Option<&str>) -> Result<(), StateError> {
        self.check_writable(key, agent_id)?;
        match self.entries.remove(key) {
            Some(entry) if entry.value.is_some() => {
                self.dirty = true;
                Ok(())
            }
            _ => Err(StateError::NotFound(key.to_string())),
        }
    }

    fn lock(&mut self, key: &str, agent_id: &str) -> bool {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StateEntry::new(key));
        match entry.locked_by.as_deref() {
            None => {
                entry.locked_by = Some(agent_id.to_string());
                entry.locked_at = Some(Utc::now());
                true
            }
            Some(holder) => holder == agent_id,
        }
    }

    fn unlock(&mut self, key: &str, agent_id: &str) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if entry.locked_by.as_deref() != Some(agent_id) {
            return false;
        }
        entry.locked_by = None;
        entry.locked_at = None;
        if entry.value.is_none() {
            self.entries.remove(key);
        }
        true
    }
}

/// Thread-safe key/value store shared by all agents
pub struct SharedState {
    table: Mutex<StateTable>,
    persistence_path: Option<PathBuf>,
}

impl SharedState {
    /// In-memory store with no persistence
    pub fn new() -> Self {
        Self {
            table: Mutex::new(StateTable::default()),
            persistence_path: None,
        }
    }

    /// Store that saves to `path` on `save()` and when dropped dirty
    pub fn with_persistence(path: impl Into<PathBuf>) -> Self {
        Self {
            table: Mutex::new(StateTable::default()),
            persistence_path: Some(path.into()),
        }
    }

    pub fn persistence_path(&self) -> Option<&Path> {
        self.persistence_path.as_deref()
    }

    /// Set a value. Fails if any agent holds the key's lock.
    pub fn set(&self, key: &str, value: &str) -> Result<(), StateError> {
        lock_mutex_recover(&self.table).set(key, value, None)
    }

    /// Set a value on behalf of `agent_id`. Fails if another agent holds the lock.
    pub fn set_as(&self, key: &str, value: &str, agent_id: &str) -> Result<(), StateError> {
        lock_mutex_recover(&self.table).set(key, value, Some(agent_id))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        lock_mutex_recover(&self.table)
            .entries
            .get(key)
            .and_then(|e| e.value.clone())
    }

    pub fn exists(&self, key: &str) -> bool {
        lock_mutex_recover(&self.table)
            .entries
            .get(key)
            .map_or(false, |e| e.value.is_some())
    }

    /// Snapshot of an entry including lock metadata
    pub fn entry(&self, key: &str) -> Option<StateEntry> {
        lock_mutex_recover(&self.table).entries.get(key).cloned()
    }

    pub fn delete(&self, key: &str) -> Result<(), StateError> {
        lock_mutex_recover(&self.table).delete(key, None)
    }

    pub fn delete_as(&self, key: &str, agent_id: &str) -> Result<(), StateError> {
        lock_mutex_recover(&self.table).delete(key, Some(agent_id))
    }

    /// Mark `key` as owned by `agent_id`. Never blocks.
    ///
    /// Succeeds if the key is free or already held by the same agent.
    pub fn lock(&self, key: &str, agent_id: &str) -> bool {
        let acquired = lock_mutex_recover(&self.table).lock(key, agent_id);
        if !acquired {
            log::debug!("Agent '{}' could not lock key '{}'", agent_id, key);
        }
        acquired
    }

    /// Same semantics as `lock`; neither variant waits
    pub fn trylock(&self, key: &str, agent_id: &str) -> bool {
        self.lock(key, agent_id)
    }

    /// Release a lock. Only the current holder can unlock.
    pub fn unlock(&self, key: &str, agent_id: &str) -> bool {
        lock_mutex_recover(&self.table).unlock(key, agent_id)
    }

    pub fn lock_holder(&self, key: &str) -> Option<String> {
        lock_mutex_recover(&self.table)
            .entries
            .get(key)
            .and_then(|e| e.locked_by.clone())
    }

    /// Release every lock held by an agent, returning how many were released
    pub fn clear_locks_for(&self, agent_id: &str) -> usize {
        let mut table = lock_mutex_recover(&self.table);
        let keys: Vec<String> = table
            .entries
            .values()
            .filter(|e| e.locked_by.as_deref() == Some(agent_id))
            .map(|e| e.key.clone())
            .collect();
        for key in &keys {
            table.unlock(key, agent_id);
        }
        keys.len()
    }

    /// Snapshot of all keys holding a value, sorted
    pub fn keys(&self) -> Vec<String> {
        self.keys_with_prefix("")
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let table = lock_mutex_recover(&self.table);
        let mut keys: Vec<String> = table
            .entries
            .values()
            .filter(|e| e.value.is_some() && e.key.starts_with(prefix))
            .map(|e| e.key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        lock_mutex_recover(&self.table)
            .entries
            .values()
            .filter(|e| e.value.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dirty(&self) -> bool {
        lock_mutex_recover(&self.table).dirty
    }

    /// Save to the configured persistence path
    pub fn save(&self) -> Result<(), StateError> {
        let path = self
            .persistence_path
            .as_deref()
            .ok_or(StateError::NoPersistencePath)?;
        self.save_to(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), StateError> {
        let persisted = {
            let table = lock_mutex_recover(&self.table);
            PersistedState {
                entries: table
                    .entries
                    .values()
                    .filter_map(|e| e.value.clone().map(|v| (e.key.clone(), v)))
                    .collect(),
            }
        };

        let content = serde_json::to_string_pretty(&persisted)
            .map_err(|e| StateError::Parse(format!("Failed to serialize state: {}", e)))?;
        with_file_lock(path, true, || atomic_write(path, &content)).map_err(StateError::Io)?;

        lock_mutex_recover(&self.table).dirty = false;
        log::debug!(
            "Saved {} state entries to {}",
            persisted.entries.len(),
            path.display()
        );
        Ok(())
    }

    /// Load from the configured persistence path
    pub fn load(&self) -> Result<usize, StateError> {
        let path = self
            .persistence_path
            .as_deref()
            .ok_or(StateError::NoPersistencePath)?;
        self.load_from(path)
    }

    /// Merge a persisted file into the table, returning how many keys were read.
    ///
    /// A missing file is an empty state. A malformed file is reported and
    /// leaves the table untouched.
    pub fn load_from(&self, path: &Path) -> Result<usize, StateError> {
        if !path.exists() {
            log::debug!("No state file at {}, starting empty", path.display());
            return Ok(0);
        }

        let persisted: PersistedState = with_file_lock(path, false, || read_json(path))
            .map_err(|e| {
                log::warn!("Ignoring state file {}: {}", path.display(), e);
                StateError::Parse(e)
            })?;

        let count = persisted.entries.len();
        let mut table = lock_mutex_recover(&self.table);
        let now = Utc::now();
        for (key, value) in persisted.entries {
            let entry = table
                .entries
                .entry(key.clone())
                .or_insert_with(|| StateEntry::new(&key));
            entry.value = Some(value);
            entry.updated_at = now;
        }

        log::info!("Loaded {} state entries from {}", count, path.display());
        Ok(count)
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SharedState {
    fn drop(&mut self) {
        if self.persistence_path.is_none() || !self.is_dirty() {
            return;
        }
        if let Err(e) = self.save() {
            log::warn!("Failed to save shared state on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_set_get_delete() {
        let state = SharedState::new();
        assert!(state.get("build.status").is_none());
        state.set("build.status", "running").unwrap();
        assert_eq!(state.get("build.status").as_deref(), Some("running"));
        assert!(state.exists("build.status"));
        assert!(!state.exists("Build.Status"));

        state.set("build.status", "done").unwrap();
        assert_eq!(state.get("build.status").as_deref(), Some("done"));
        assert_eq!(state.len(), 1);

        state.delete("build.status").unwrap();
        assert!(!state.exists("build.status"));
        assert_eq!(
            state.delete("build.status").unwrap_err(),
            StateError::NotFound("build.status".to_string())
        );
    }

    #[test]
    fn test_advisory_lock_semantics() {
        let state = SharedState::new();
        let key = "context.plan";

        assert!(state.lock(key, "agent1"));
        // Re-entrant for the holder, immediate failure for others
        assert!(state.lock(key, "agent1"));
        assert!(!state.lock(key, "agent2"));
        assert!(!state.trylock(key, "agent2"));

        assert_eq!(
            state.set_as(key, "v", "agent2").unwrap_err(),
            StateError::Locked {
                key: key.to_string(),
                holder: "agent1".to_string()
            }
        );
        assert!(state.set(key, "anonymous").is_err());
        state.set_as(key, "v1", "agent1").unwrap();

        assert!(!state.unlock(key, "agent2"));
        assert!(state.unlock(key, "agent1"));
        assert!(state.lock_holder(key).is_none());

        state.set_as(key, "v2", "agent2").unwrap();
        assert_eq!(state.get(key).as_deref(), Some("v2"));
    }

    #[test]
    fn test_lock_only_entries_are_invisible() {
        let state = SharedState::new();
        assert!(state.lock("placeholder", "agent1"));
        assert!(!state.exists("placeholder"));
        assert!(state.keys().is_empty());
        assert_eq!(state.lock_holder("placeholder").as_deref(), Some("agent1"));

        assert!(state.unlock("placeholder", "agent1"));
        assert!(state.entry("placeholder").is_none());
    }

    #[test]
    fn test_delete_respects_lock() {
        let state = SharedState::new();
        state.set("k", "v").unwrap();
        assert!(state.lock("k", "owner"));
        assert!(state.delete("k").is_err());
        assert!(state.delete_as("k", "intruder").is_err());
        state.delete_as("k", "owner").unwrap();
        assert!(!state.exists("k"));
    }

    #[test]
    fn test_keys_with_prefix() {
        let state = SharedState::new();
        state.set("alpha.status", "idle").unwrap();
        state.set("alpha.result", "ok").unwrap();
        state.set("beta.status", "running").unwrap();

        assert_eq!(
            state.keys_with_prefix("alpha."),
            vec!["alpha.result".to_string(), "alpha.status".to_string()]
        );
        assert_eq!(state.keys().len(), 3);
    }

    #[test]
    fn test_clear_locks_for() {
        let state = SharedState::new();
        state.set("a", "1").unwrap();
        assert!(state.lock("a", "agent1"));
        assert!(state.lock("b", "agent1"));
        assert!(state.lock("c", "agent2"));

        assert_eq!(state.clear_locks_for("agent1"), 2);
        assert!(state.lock_holder("a").is_none());
        assert_eq!(state.lock_holder("c").as_deref(), Some("agent2"));
    }

    #[test]
    fn test_save_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");

        let state = SharedState::with_persistence(&path);
        state.set("alpha", "1").unwrap();
        state.set("beta", "two words").unwrap();
        state.set("gamma", "{\"nested\": true}").unwrap();
        assert!(state.lock("alpha", "agent1"));
        state.save().unwrap();
        assert!(!state.is_dirty());

        let restored = SharedState::new();
        assert_eq!(restored.load_from(&path).unwrap(), 3);
        assert_eq!(restored.get("alpha").as_deref(), Some("1"));
        assert_eq!(restored.get("beta").as_deref(), Some("two words"));
        assert_eq!(restored.get("gamma").as_deref(), Some("{\"nested\": true}"));
        // Locks are not persisted
        assert!(restored.lock_holder("alpha").is_none());
    }

    #[test]
    fn test_file_format() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");
        let state = SharedState::new();
        state.set("key", "value").unwrap();
        state.save_to(&path).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["entries"]["key"], "value");
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let state = SharedState::with_persistence(temp_dir.path().join("missing.json"));
        assert_eq!(state.load().unwrap(), 0);
        assert!(state.is_empty());
    }

    #[test]
    fn test_load_malformed_leaves_state_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");
        fs::write(&path, "{\"entries\": [oops").unwrap();

        let state = SharedState::new();
        state.set("existing", "kept").unwrap();
        assert!(matches!(state.load_from(&path), Err(StateError::Parse(_))));
        assert_eq!(state.keys(), vec!["existing".to_string()]);
    }

    #[test]
    fn test_save_without_path() {
        let state = SharedState::new();
        assert_eq!(state.save().unwrap_err(), StateError::NoPersistencePath);
    }

    #[test]
    fn test_dirty_state_saved_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");
        {
            let state = SharedState::with_persistence(&path);
            state.set("persisted", "yes").unwrap();
        }

        let restored = SharedState::with_persistence(&path);
        restored.load().unwrap();
        assert_eq!(restored.get("persisted").as_deref(), Some("yes"));
    }
}
