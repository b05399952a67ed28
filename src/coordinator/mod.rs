//! Agent coordinator
//!
//! Matches tasks to agents, arbitrates named resources between agents and
//! aggregates their results. The resource-ownership table here is separate
//! from `SharedState` key locks: resources are logical names ("file.txt"),
//! shared-state locks guard context keys. Neither consults the other.
//! Ownership is mirrored read-only into shared state under
//! `coordinator.resource.<id>` so agents can see who holds what.

mod conflict;

pub use conflict::{
    AgentConflict, ConflictResolution, ConflictType, CoordinatorConfig, PromptCallback,
    ResolutionStrategy,
};

use crate::agents::{AgentError, AgentInstance, AgentRegistry, AssignError};
use crate::events::{
    resource_key, to_payload, ResourceConflictPayload, ResourceOwnershipPayload, TaskAssignedPayload,
    EVENT_RESOURCE_CONFLICT, EVENT_RESOURCE_GRANTED, EVENT_RESOURCE_REVOKED, EVENT_TASK_ASSIGNED,
};
use crate::message_bus::{AgentMessage, MessageBus, MessageType};
use crate::models::{AgentState, AgentType, Capabilities, Task, TaskId, TaskType};
use crate::shared_state::SharedState;
use crate::task_queue::TaskQueue;
use crate::utils::lock_mutex_recover;
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Sender id used for coordinator messages
pub const COORDINATOR_ID: &str = "coordinator";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    #[error("No suitable agent for task {0}")]
    NoSuitableAgent(TaskId),

    #[error("Conflict '{0}' not found")]
    ConflictNotFound(String),

    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Outcome of a group of agents
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub success_count: usize,
    pub failure_count: usize,
    pub timeout_count: usize,
    pub first_error: Option<String>,
    pub combined_output: String,
    pub total_runtime_sec: f64,
}

impl AggregateResult {
    pub fn total(&self) -> usize {
        self.success_count + self.failure_count + self.timeout_count
    }

    pub fn all_succeeded(&self) -> bool {
        self.failure_count == 0 && self.timeout_count == 0
    }
}

#[derive(Default)]
struct ResourceTable {
    owners: HashMap<String, String>,
    waiting: HashMap<String, VecDeque<String>>,
    conflicts: Vec<AgentConflict>,
}

impl ResourceTable {
    fn enqueue_waiter(&mut self, resource_id: &str, agent_id: &str) {
        let queue = self.waiting.entry(resource_id.to_string()).or_default();
        if !queue.iter().any(|a| a == agent_id) {
            queue.push_back(agent_id.to_string());
        }
    }

    fn next_waiter(&mut self, resource_id: &str) -> Option<String> {
        let queue = self.waiting.get_mut(resource_id)?;
        let next = queue.pop_front();
        if queue.is_empty() {
            self.waiting.remove(resource_id);
        }
        next
    }

    fn drop_waiter(&mut self, agent_id: &str) {
        for queue in self.waiting.values_mut() {
            queue.retain(|a| a != agent_id);
        }
        self.waiting.retain(|_, queue| !queue.is_empty());
    }
}

/// Affinity of an agent type for a task type
fn affinity(task_type: TaskType, agent_type: AgentType) -> i64 {
    match (task_type, agent_type) {
        (TaskType::Build, AgentType::Build) => 100,
        (TaskType::Fix | TaskType::Analyze, AgentType::Smart) => 100,
        (TaskType::Fix | TaskType::Analyze, AgentType::Build) => 50,
        (TaskType::Execute | TaskType::Modify, AgentType::Autonomous) => 100,
        _ => 50,
    }
}

/// Affinity minus a load penalty of one point per completed task
fn score(task: &Task, agent: &AgentInstance) -> i64 {
    let completed = i64::try_from(agent.stats().tasks_completed).unwrap_or(i64::MAX);
    affinity(task.task_type, agent.agent_type()).saturating_sub(completed)
}

pub struct AgentCoordinator {
    registry: Arc<AgentRegistry>,
    bus: Arc<MessageBus>,
    shared: Arc<SharedState>,
    queue: Arc<TaskQueue>,
    config: CoordinatorConfig,
    table: Mutex<ResourceTable>,
    finished: Arc<Mutex<Vec<Task>>>,
}

impl AgentCoordinator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        bus: Arc<MessageBus>,
        shared: Arc<SharedState>,
        queue: Arc<TaskQueue>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            registry,
            bus,
            shared,
            queue,
            config,
            table: Mutex::new(ResourceTable::default()),
            finished: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Publish the current owner of a resource, or clear it when free.
    /// Called with the table lock held so the mirror follows table order.
    fn mirror_owner(&self, resource_id: &str, owner: Option<&str>) {
        let key = resource_key(resource_id);
        let result = match owner {
            Some(owner) => self.shared.set(&key, owner),
            None if self.shared.exists(&key) => self.shared.delete(&key),
            None => Ok(()),
        };
        if let Err(e) = result {
            log::warn!("Could not mirror owner of '{}': {}", resource_id, e);
        }
    }

    /// Give tasks without their own timeout the configured one
    fn apply_default_timeout(&self, task: &mut Task) {
        if task.timeout_sec == 0 {
            task.timeout_sec = self.config.task_timeout.as_secs();
        }
    }

    /// Agents currently running or holding a pool thread
    pub fn in_flight(&self) -> usize {
        self.registry
            .list()
            .iter()
            .filter(|a| {
                a.is_thread_active() || matches!(a.state(), AgentState::Running | AgentState::Paused)
            })
            .count()
    }

    fn notify(&self, receiver_id: &str, message_type: MessageType, payload: String) {
        let message = AgentMessage::new(message_type, COORDINATOR_ID, receiver_id).with_payload(payload);
        if let Err(e) = self.bus.send(message) {
            log::debug!("Coordinator message to '{}' dropped: {}", receiver_id, e);
        }
    }

    /// Hand a task to the best idle agent.
    ///
    /// An idle agent named by `preferred_agent` wins outright. Otherwise the
    /// highest score wins, ties going to the agent created first.
    pub fn assign_task(
        &self,
        mut task: Task,
    ) -> Result<Arc<AgentInstance>, AssignError<CoordinatorError>> {
        let candidates: Vec<Arc<AgentInstance>> = self
            .registry
            .idle_agents()
            .into_iter()
            .filter(|a| a.capabilities().contains(task.required_capabilities))
            .collect();

        let preferred = task
            .preferred_agent
            .as_deref()
            .and_then(|name| candidates.iter().find(|a| a.name() == name));

        let chosen = preferred.or_else(|| {
            let mut best: Option<(i64, &Arc<AgentInstance>)> = None;
            for agent in &candidates {
                let s = score(&task, agent);
                if best.map_or(true, |(best_score, _)| s > best_score) {
                    best = Some((s, agent));
                }
            }
            best.map(|(_, agent)| agent)
        });

        let Some(agent) = chosen.cloned() else {
            log::debug!("No suitable agent for task {}", task.id);
            return Err(AssignError {
                reason: CoordinatorError::NoSuitableAgent(task.id),
                task,
            });
        };

        let payload = to_payload(
            EVENT_TASK_ASSIGNED,
            TaskAssignedPayload {
                task_id: task.id,
                agent_id: agent.id().to_string(),
                description: task.description.clone(),
            },
        );
        let task_id = task.id;
        self.apply_default_timeout(&mut task);
        agent.assign_task(task).map_err(|e| AssignError {
            task: e.task,
            reason: CoordinatorError::Agent(e.reason),
        })?;
        log::info!("Assigned task {} to agent '{}'", task_id, agent.name());
        self.notify(agent.id(), MessageType::TaskRequest, payload);
        Ok(agent)
    }

    /// Create and start `count` autonomous workers for a task.
    ///
    /// Workers become children of the task's assigned agent when that agent
    /// can spawn.
    pub fn spawn_workers(
        &self,
        parent_task: &Task,
        count: usize,
    ) -> Result<Vec<Arc<AgentInstance>>, CoordinatorError> {
        let parent = parent_task
            .assigned_agent_id
            .as_deref()
            .and_then(|id| self.registry.get(id))
            .filter(|p| p.capabilities().contains(Capabilities::SPAWN));

        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let name = format!("worker-{}-{}", parent_task.id, index);
            let worker = match &parent {
                Some(parent) => {
                    self.registry
                        .spawn_child(parent.id(), &name, AgentType::Autonomous)?
                }
                None => self.registry.create(&name, AgentType::Autonomous)?,
            };
            worker.start()?;
            self.bus.register(worker.id());
            workers.push(worker);
        }

        log::info!(
            "Spawned {} workers for task {}",
            workers.len(),
            parent_task.id
        );
        Ok(workers)
    }

    /// Pull eligible queued tasks onto idle agents and start them on the pool.
    ///
    /// Stops once `max_concurrent` agents are in flight (0 means no cap).
    /// Returns how many tasks were started. Finished tasks are collected for
    /// `take_finished`.
    pub fn dispatch(&self) -> usize {
        let limit = self.config.max_concurrent;
        let mut in_flight = self.in_flight();
        let mut started = 0;
        for agent in self.registry.idle_agents() {
            if limit > 0 && in_flight >= limit {
                log::debug!("Dispatch paused at {} tasks in flight", in_flight);
                break;
            }
            let Some(mut task) = self.queue.pop_for_agent(agent.name(), agent.capabilities())
            else {
                continue;
            };
            let task_id = task.id;
            self.queue.update_dependencies(task_id);
            self.apply_default_timeout(&mut task);

            if let Err(e) = agent.assign_task(task) {
                log::warn!("{}", e);
                self.requeue(e.task);
                continue;
            }

            let finished = Arc::clone(&self.finished);
            let queue = Arc::clone(&self.queue);
            let result = agent.run_assigned_async(move |task| {
                queue.update_dependencies(task.id);
                lock_mutex_recover(&finished).push(task);
            });

            match result {
                Ok(()) => {
                    log::debug!("Dispatched task {} to '{}'", task_id, agent.name());
                    started += 1;
                    in_flight += 1;
                }
                Err(e) => {
                    log::warn!("Could not start task {} on '{}': {}", task_id, agent.name(), e);
                    if let Some(task) = agent.take_task() {
                        self.requeue(task);
                    }
                }
            }
        }
        started
    }

    fn requeue(&self, task: Task) {
        let task_id = task.id;
        if let Err(e) = self.queue.push(task) {
            log::error!("Task {} lost: {}", task_id, e);
        }
    }

    /// Drain tasks finished by dispatched agents
    pub fn take_finished(&self) -> Vec<Task> {
        std::mem::take(&mut *lock_mutex_recover(&self.finished))
    }

    /// Claim a named resource.
    ///
    /// Granted if free or already held by `agent_id`. Otherwise a conflict is
    /// recorded, the requester is told over the bus, and the request is
    /// denied. Conflicts are never resolved here.
    pub fn request_resource(&self, agent_id: &str, resource_id: &str, action: &str) -> bool {
        let mut table = lock_mutex_recover(&self.table);
        let holder = match table.owners.get(resource_id) {
            None => {
                table
                    .owners
                    .insert(resource_id.to_string(), agent_id.to_string());
                self.mirror_owner(resource_id, Some(agent_id));
                log::debug!("Resource '{}' granted to '{}'", resource_id, agent_id);
                return true;
            }
            Some(owner) if owner == agent_id => return true,
            Some(owner) => owner.clone(),
        };

        let conflict = AgentConflict::new(
            ConflictType::Resource,
            &holder,
            agent_id,
            resource_id,
            format!("'{}' requested to {} '{}'", agent_id, action, resource_id),
        );
        let payload = to_payload(
            EVENT_RESOURCE_CONFLICT,
            ResourceConflictPayload {
                conflict_id: conflict.id.clone(),
                resource_id: resource_id.to_string(),
                holder_id: holder.clone(),
                requester_id: agent_id.to_string(),
                action: action.to_string(),
            },
        );
        log::info!(
            "Conflict {}: '{}' wants '{}' held by '{}'",
            conflict.id,
            agent_id,
            resource_id,
            holder
        );
        table.conflicts.push(conflict);
        drop(table);

        self.notify(agent_id, MessageType::ResourceConflict, payload);
        false
    }

    /// Release a resource. Only the owner can. A sequential waiter, if any,
    /// becomes the new owner.
    pub fn release_resource(&self, agent_id: &str, resource_id: &str) -> bool {
        let mut table = lock_mutex_recover(&self.table);
        if table.owners.get(resource_id).map(String::as_str) != Some(agent_id) {
            return false;
        }

        let next = table.next_waiter(resource_id);
        match &next {
            Some(next) => {
                table.owners.insert(resource_id.to_string(), next.clone());
            }
            None => {
                table.owners.remove(resource_id);
            }
        }
        self.mirror_owner(resource_id, next.as_deref());
        drop(table);

        log::debug!("Resource '{}' released by '{}'", resource_id, agent_id);
        if let Some(next) = next {
            self.notify(
                &next,
                MessageType::ResourceRelease,
                to_payload(
                    EVENT_RESOURCE_GRANTED,
                    ResourceOwnershipPayload {
                        resource_id: resource_id.to_string(),
                        agent_id: next.clone(),
                        reason: format!("released by {}", agent_id),
                    },
                ),
            );
        }
        true
    }

    /// Release everything an agent holds and drop it from waiting lines
    pub fn release_all(&self, agent_id: &str) -> usize {
        let held: Vec<String> = {
            let mut table = lock_mutex_recover(&self.table);
            table.drop_waiter(agent_id);
            table
                .owners
                .iter()
                .filter(|(_, owner)| owner.as_str() == agent_id)
                .map(|(resource, _)| resource.clone())
                .collect()
        };
        held.iter()
            .filter(|resource| self.release_resource(agent_id, resource))
            .count()
    }

    pub fn resource_owner(&self, resource_id: &str) -> Option<String> {
        lock_mutex_recover(&self.table).owners.get(resource_id).cloned()
    }

    /// First unresolved conflict, if any
    pub fn detect_conflict(&self) -> Option<AgentConflict> {
        lock_mutex_recover(&self.table)
            .conflicts
            .iter()
            .find(|c| !c.is_resolved())
            .cloned()
    }

    pub fn conflicts(&self) -> Vec<AgentConflict> {
        lock_mutex_recover(&self.table).conflicts.clone()
    }

    pub fn unresolved_count(&self) -> usize {
        lock_mutex_recover(&self.table)
            .conflicts
            .iter()
            .filter(|c| !c.is_resolved())
            .count()
    }

    /// Settle a recorded conflict and apply the outcome to resource ownership
    pub fn resolve_conflict(&self, conflict_id: &str) -> Result<ConflictResolution, CoordinatorError> {
        let conflict = lock_mutex_recover(&self.table)
            .conflicts
            .iter()
            .find(|c| c.id == conflict_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::ConflictNotFound(conflict_id.to_string()))?;

        if let Some(resolution) = conflict.resolution {
            return Ok(resolution);
        }

        // The prompt callback runs without the table lock held
        let chosen = self.choose_resolution(&conflict);
        let resolution = self.apply_resolution(&conflict, chosen);
        log::info!("Conflict {} resolved: {:?}", conflict.id, resolution);
        Ok(resolution)
    }

    fn choose_resolution(&self, conflict: &AgentConflict) -> ConflictResolution {
        match self.config.strategy {
            ResolutionStrategy::FirstWins => ConflictResolution::Agent1Wins,
            ResolutionStrategy::SecondWins => ConflictResolution::Agent2Wins,
            ResolutionStrategy::Sequential => ConflictResolution::Sequential,
            ResolutionStrategy::CancelBoth => ConflictResolution::CancelBoth,
            ResolutionStrategy::PromptUser => match &self.config.prompt_user {
                Some(prompt) => {
                    let message = conflict.prompt_message();
                    let index = prompt(conflict, &message, &ConflictResolution::OPTIONS);
                    ConflictResolution::from_index(index).unwrap_or_else(|| {
                        log::warn!(
                            "Prompt returned invalid option {} for conflict {}, agent '{}' wins",
                            index,
                            conflict.id,
                            conflict.agent1_id
                        );
                        ConflictResolution::Agent1Wins
                    })
                }
                None => {
                    log::warn!(
                        "No prompt configured for conflict {}, agent '{}' wins",
                        conflict.id,
                        conflict.agent1_id
                    );
                    ConflictResolution::Agent1Wins
                }
            },
        }
    }

    /// Apply `resolution` unless another caller settled the conflict first,
    /// in which case the earlier outcome is returned untouched.
    fn apply_resolution(
        &self,
        conflict: &AgentConflict,
        resolution: ConflictResolution,
    ) -> ConflictResolution {
        let resource = conflict.resource_id.as_str();
        let agent1 = conflict.agent1_id.as_str();
        let agent2 = conflict.agent2_id.as_str();
        let mut granted: Option<&str> = None;
        let mut revoked: Vec<&str> = Vec::new();

        {
            let mut table = lock_mutex_recover(&self.table);
            let settled = table
                .conflicts
                .iter()
                .find(|c| c.id == conflict.id)
                .and_then(|c| c.resolution);
            if let Some(earlier) = settled {
                log::debug!("Conflict {} already resolved: {:?}", conflict.id, earlier);
                return earlier;
            }

            let owner = table.owners.get(resource).cloned();
            // Ownership moves only between the two parties or from nobody
            let contested = owner
                .as_deref()
                .map_or(true, |o| o == agent1 || o == agent2);

            match resolution {
                ConflictResolution::Agent1Wins => {
                    if contested && owner.as_deref() != Some(agent1) {
                        table.owners.insert(resource.to_string(), agent1.to_string());
                        granted = Some(agent1);
                    }
                }
                ConflictResolution::Agent2Wins => {
                    if contested && owner.as_deref() != Some(agent2) {
                        if owner.as_deref() == Some(agent1) {
                            revoked.push(agent1);
                        }
                        table.owners.insert(resource.to_string(), agent2.to_string());
                        granted = Some(agent2);
                    }
                }
                ConflictResolution::Sequential => {
                    if owner.is_none() {
                        table.owners.insert(resource.to_string(), agent2.to_string());
                        granted = Some(agent2);
                    } else if owner.as_deref() != Some(agent2) {
                        table.enqueue_waiter(resource, agent2);
                    }
                }
                ConflictResolution::CancelBoth => {
                    if let Some(owner) = owner.as_deref().filter(|_| contested) {
                        revoked.push(if owner == agent1 { agent1 } else { agent2 });
                        table.owners.remove(resource);
                    }
                    if let Some(queue) = table.waiting.get_mut(resource) {
                        queue.retain(|a| a != agent1 && a != agent2);
                    }
                    table.waiting.retain(|_, queue| !queue.is_empty());
                }
            }

            if let Some(record) = table.conflicts.iter_mut().find(|c| c.id == conflict.id) {
                record.resolved_at = Some(Utc::now());
                record.resolution = Some(resolution);
            }
            let final_owner = table.owners.get(resource).cloned();
            self.mirror_owner(resource, final_owner.as_deref());
        }

        for agent in revoked {
            self.notify(
                agent,
                MessageType::ResourceRelease,
                to_payload(
                    EVENT_RESOURCE_REVOKED,
                    ResourceOwnershipPayload {
                        resource_id: resource.to_string(),
                        agent_id: agent.to_string(),
                        reason: format!("conflict {} resolved {:?}", conflict.id, resolution),
                    },
                ),
            );
        }
        if let Some(agent) = granted {
            self.notify(
                agent,
                MessageType::ResourceRelease,
                to_payload(
                    EVENT_RESOURCE_GRANTED,
                    ResourceOwnershipPayload {
                        resource_id: resource.to_string(),
                        agent_id: agent.to_string(),
                        reason: format!("conflict {} resolved {:?}", conflict.id, resolution),
                    },
                ),
            );
        }
        resolution
    }

    /// Wait until no registered agent has work in flight
    pub fn wait_all(&self, timeout: Option<Duration>) -> bool {
        self.registry.wait_all(timeout)
    }

    /// Summarize a group of agents by their final state
    pub fn aggregate_results(&self, agents: &[Arc<AgentInstance>]) -> AggregateResult {
        aggregate_results(agents)
    }
}

/// Classify agents by terminal state: `completed` succeeded, `error` or
/// `terminated` failed, anything else timed out.
pub fn aggregate_results(agents: &[Arc<AgentInstance>]) -> AggregateResult {
    let mut result = AggregateResult::default();

    for agent in agents {
        let summary = agent.snapshot();
        result.total_runtime_sec += summary.stats.total_runtime_sec;

        match summary.state {
            AgentState::Completed => {
                result.success_count += 1;
                result.combined_output.push_str(&format!(
                    "[{}]:\n{}\n\n",
                    summary.name,
                    summary.last_result.unwrap_or_default()
                ));
            }
            AgentState::Error | AgentState::Terminated => {
                result.failure_count += 1;
                if result.first_error.is_none() {
                    result.first_error = summary.last_error;
                }
            }
            _ => result.timeout_count += 1,
        }
    }

    result
}
