//! A single agent: lifecycle state, assigned task, statistics and children
//!
//! All mutable fields live behind one mutex. A condition variable is
//! notified on every state change and whenever an async run finishes, so
//! `wait`/`wait_children` block instead of polling.
//!
//! Children are held as `Weak` references; the registry owns every agent.

use crate::agents::pool::ThreadPool;
use crate::agents::runner::{AgentRunner, ProgressSink, RunContext};
use crate::events::{
    agent_key, KEY_ERROR, KEY_PROGRESS, KEY_RESULT, KEY_STATUS, KEY_TASK, STATUS_COMPLETED,
    STATUS_FAILED, STATUS_RUNNING,
};
use crate::models::state_machine::{is_active_state, transition_state};
use crate::models::{AgentState, AgentType, Capabilities, Task, TaskId, TaskState};
use crate::shared_state::SharedState;
use crate::utils::{generate_id, lock_mutex_recover, wait_recover, wait_timeout_recover};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("Agent '{0}' not found")]
    NotFound(String),

    #[error("An agent named '{0}' already exists")]
    DuplicateName(String),

    #[error("Invalid agent state transition from {from} to {to}")]
    InvalidTransition { from: AgentState, to: AgentState },

    #[error("Agent '{0}' already has work in flight")]
    Busy(String),

    #[error("Agent '{name}' is {state}, not idle")]
    NotIdle { name: String, state: AgentState },

    #[error("Agent '{name}' lacks required capabilities {required:?}")]
    MissingCapability {
        name: String,
        required: Capabilities,
    },

    #[error("Thread pool rejected work for agent '{0}'")]
    PoolRejected(String),

    #[error("Agent '{0}' has no assigned task")]
    NoTask(String),

    #[error("Agent type {0} needs a caller-supplied runner")]
    UnsupportedType(AgentType),

    #[error("{0}")]
    Execution(String),
}

/// A failed hand-off. The task is returned so it is never lost.
pub struct AssignError<E = AgentError> {
    pub task: Task,
    pub reason: E,
}

impl<E: fmt::Display> fmt::Display for AssignError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to assign task {}: {}", self.task.id, self.reason)
    }
}

impl<E: fmt::Debug> fmt::Debug for AssignError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssignError")
            .field("task_id", &self.task.id)
            .field("reason", &self.reason)
            .finish()
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AssignError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.reason)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStats {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub total_runtime_sec: f64,
}

/// Serializable point-in-time view of an agent
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
    pub agent_type: AgentType,
    pub state: AgentState,
    pub capabilities: Capabilities,
    pub parent_id: Option<String>,
    pub children: Vec<String>,
    pub current_task_id: Option<TaskId>,
    pub thread_active: bool,
    pub stats: AgentStats,
    pub last_result: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

struct AgentInner {
    state: AgentState,
    current_task: Option<Task>,
    thread_active: bool,
    children: Vec<Weak<AgentInstance>>,
    stats: AgentStats,
    last_result: Option<String>,
    last_error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    run_started: Option<Instant>,
}

type TaskSlot = Arc<Mutex<Option<Task>>>;

pub struct AgentInstance {
    id: String,
    name: String,
    agent_type: AgentType,
    capabilities: Capabilities,
    parent_id: Option<String>,
    created_at: DateTime<Utc>,
    runner: Box<dyn AgentRunner>,
    pool: Arc<dyn ThreadPool>,
    shared: Arc<SharedState>,
    inner: Mutex<AgentInner>,
    changed: Condvar,
}

impl AgentInstance {
    pub(crate) fn new(
        name: &str,
        agent_type: AgentType,
        capabilities: Capabilities,
        runner: Box<dyn AgentRunner>,
        parent_id: Option<String>,
        pool: Arc<dyn ThreadPool>,
        shared: Arc<SharedState>,
    ) -> Self {
        Self {
            id: generate_id(),
            name: name.to_string(),
            agent_type,
            capabilities,
            parent_id,
            created_at: Utc::now(),
            runner,
            pool,
            shared,
            inner: Mutex::new(AgentInner {
                state: AgentState::Created,
                current_task: None,
                thread_active: false,
                children: Vec::new(),
                stats: AgentStats::default(),
                last_result: None,
                last_error: None,
                started_at: None,
                completed_at: None,
                run_started: None,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn state(&self) -> AgentState {
        lock_mutex_recover(&self.inner).state
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    /// Idle, holding no task, nothing in flight
    pub fn is_available(&self) -> bool {
        let inner = lock_mutex_recover(&self.inner);
        inner.state == AgentState::Idle && inner.current_task.is_none() && !inner.thread_active
    }

    pub fn is_thread_active(&self) -> bool {
        lock_mutex_recover(&self.inner).thread_active
    }

    pub fn stats(&self) -> AgentStats {
        lock_mutex_recover(&self.inner).stats.clone()
    }

    pub fn last_result(&self) -> Option<String> {
        lock_mutex_recover(&self.inner).last_result.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        lock_mutex_recover(&self.inner).last_error.clone()
    }

    pub fn current_task_id(&self) -> Option<TaskId> {
        lock_mutex_recover(&self.inner)
            .current_task
            .as_ref()
            .map(|t| t.id)
    }

    /// Live children. Children dropped from the registry are skipped.
    pub fn children(&self) -> Vec<Arc<AgentInstance>> {
        lock_mutex_recover(&self.inner)
            .children
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn children_ids(&self) -> Vec<String> {
        self.children().iter().map(|c| c.id.clone()).collect()
    }

    pub(crate) fn add_child(&self, child: &Arc<AgentInstance>) {
        let mut inner = lock_mutex_recover(&self.inner);
        inner.children.retain(|c| c.strong_count() > 0);
        inner.children.push(Arc::downgrade(child));
    }

    pub fn snapshot(&self) -> AgentSummary {
        let children = self.children_ids();
        let inner = lock_mutex_recover(&self.inner);
        AgentSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            agent_type: self.agent_type,
            state: inner.state,
            capabilities: self.capabilities,
            parent_id: self.parent_id.clone(),
            children,
            current_task_id: inner.current_task.as_ref().map(|t| t.id),
            thread_active: inner.thread_active,
            stats: inner.stats.clone(),
            last_result: inner.last_result.clone(),
            last_error: inner.last_error.clone(),
            created_at: self.created_at,
            started_at: inner.started_at,
            completed_at: inner.completed_at,
        }
    }

    fn set_state(&self, inner: &mut AgentInner, to: AgentState) -> Result<(), AgentError> {
        let from = inner.state;
        transition_state(from, to).map_err(|_| AgentError::InvalidTransition { from, to })?;
        if from != to {
            log::debug!("Agent '{}' {} -> {}", self.name, from, to);
            inner.state = to;
            self.changed.notify_all();
        }
        Ok(())
    }

    /// Settle back to `idle` after a run. A refused transition is logged and
    /// leaves the state as it was.
    fn return_to_idle(&self, inner: &mut AgentInner) -> bool {
        match self.set_state(inner, AgentState::Idle) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Agent '{}' could not return to idle: {}", self.name, e);
                false
            }
        }
    }

    fn not_idle(&self, state: AgentState) -> AgentError {
        AgentError::NotIdle {
            name: self.name.clone(),
            state,
        }
    }

    /// Bring the agent up. Legal from `created` or `idle`; ends in `idle`.
    pub fn start(&self) -> Result<(), AgentError> {
        let mut inner = lock_mutex_recover(&self.inner);
        if !matches!(inner.state, AgentState::Created | AgentState::Idle) {
            return Err(AgentError::InvalidTransition {
                from: inner.state,
                to: AgentState::Idle,
            });
        }
        self.set_state(&mut inner, AgentState::Initializing)?;
        inner.started_at = Some(Utc::now());
        self.set_state(&mut inner, AgentState::Idle)?;
        log::info!("Agent '{}' ({}) started", self.name, self.agent_type);
        Ok(())
    }

    /// Hand a task to an idle agent
    pub fn assign_task(&self, mut task: Task) -> Result<(), AssignError> {
        let mut inner = lock_mutex_recover(&self.inner);

        let rejection = if inner.state != AgentState::Idle {
            Some(self.not_idle(inner.state))
        } else if inner.current_task.is_some() || inner.thread_active {
            Some(AgentError::Busy(self.name.clone()))
        } else if !self.capabilities.contains(task.required_capabilities) {
            Some(AgentError::MissingCapability {
                name: self.name.clone(),
                required: task.required_capabilities,
            })
        } else {
            None
        };
        if let Some(reason) = rejection {
            return Err(AssignError { task, reason });
        }

        task.mark_assigned(&self.id);
        log::debug!("Task {} assigned to agent '{}'", task.id, self.name);
        inner.current_task = Some(task);
        self.changed.notify_all();
        Ok(())
    }

    /// Give back the assigned task without running it
    pub fn take_task(&self) -> Option<Task> {
        let mut inner = lock_mutex_recover(&self.inner);
        let mut task = inner.current_task.take()?;
        task.state = TaskState::Pending;
        task.assigned_agent_id = None;
        Some(task)
    }

    /// Move to `running`, optionally taking the assigned task with it
    fn claim_run(&self, with_task: bool, thread_active: bool) -> Result<Option<Task>, AgentError> {
        let mut inner = lock_mutex_recover(&self.inner);
        if inner.thread_active {
            return Err(AgentError::Busy(self.name.clone()));
        }
        if inner.state != AgentState::Idle {
            return Err(self.not_idle(inner.state));
        }

        let task = if with_task {
            match inner.current_task.take() {
                Some(task) => Some(task),
                None => return Err(AgentError::NoTask(self.name.clone())),
            }
        } else {
            None
        };

        if let Err(e) = self.set_state(&mut inner, AgentState::Running) {
            inner.current_task = task;
            return Err(e);
        }
        inner.run_started = Some(Instant::now());
        inner.thread_active = thread_active;
        Ok(task)
    }

    fn run_context(&self, extra: Option<ProgressSink>) -> RunContext {
        let shared = Arc::clone(&self.shared);
        let key = agent_key(&self.name, KEY_PROGRESS);
        let sink: ProgressSink = Arc::new(move |percent: u8, message: &str| {
            if let Err(e) = shared.set(&key, &format!("{}:{}", percent, message)) {
                log::debug!("Progress not published: {}", e);
            }
            if let Some(extra) = &extra {
                extra(percent, message);
            }
        });
        RunContext::new(self.id.clone(), self.name.clone()).with_progress(sink)
    }

    /// Run the runner for a claimed run and settle the agent's state
    fn execute(&self, description: &str, extra: Option<ProgressSink>) -> Result<String, AgentError> {
        let ctx = self.run_context(extra);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.runner.run(description, &ctx)))
            .unwrap_or_else(|_| Err(format!("Runner for agent '{}' panicked", self.name)));
        self.finish_run(outcome)
    }

    fn finish_run(&self, outcome: Result<String, String>) -> Result<String, AgentError> {
        let mut inner = lock_mutex_recover(&self.inner);
        let elapsed = inner
            .run_started
            .take()
            .map(|started| started.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        inner.stats.total_runtime_sec += elapsed;

        match &outcome {
            Ok(output) => {
                inner.stats.tasks_completed += 1;
                inner.last_result = Some(output.clone());
            }
            Err(error) => {
                inner.stats.tasks_failed += 1;
                inner.last_error = Some(error.clone());
            }
        }

        // A run that was terminated meanwhile stays terminated
        if is_active_state(inner.state) {
            self.return_to_idle(&mut inner);
        } else {
            self.changed.notify_all();
        }

        outcome.map_err(AgentError::Execution)
    }

    fn publish(&self, field: &str, value: &str) {
        if let Err(e) = self.shared.set(&agent_key(&self.name, field), value) {
            log::debug!("Agent '{}' could not publish {}: {}", self.name, field, e);
        }
    }

    fn execute_published(
        &self,
        description: &str,
        extra: Option<ProgressSink>,
    ) -> Result<String, AgentError> {
        self.publish(KEY_STATUS, STATUS_RUNNING);
        self.publish(KEY_TASK, description);

        let result = self.execute(description, extra);
        match &result {
            Ok(output) => {
                self.publish(KEY_RESULT, output);
                self.publish(KEY_STATUS, STATUS_COMPLETED);
            }
            Err(e) => {
                log::error!("Agent '{}' failed: {}", self.name, e);
                self.publish(KEY_ERROR, &e.to_string());
                self.publish(KEY_STATUS, STATUS_FAILED);
            }
        }
        result
    }

    /// Run a claimed task to completion, forwarding progress to its callbacks
    fn execute_task(&self, slot: TaskSlot) -> Option<Task> {
        let description = {
            let mut guard = lock_mutex_recover(&slot);
            let task = guard.as_mut()?;
            task.start();
            task.description.clone()
        };

        let progress_slot = Arc::clone(&slot);
        let sink: ProgressSink = Arc::new(move |percent: u8, message: &str| {
            if let Some(task) = lock_mutex_recover(&progress_slot).as_mut() {
                task.set_progress(percent, message);
            }
        });

        let result = self.execute_published(&description, Some(sink));
        let mut task = lock_mutex_recover(&slot).take()?;
        match result {
            Ok(output) => task.complete(output),
            Err(e) => task.fail(e.to_string(), Some(1)),
        }
        Some(task)
    }

    fn submit_claimed<F>(self: &Arc<Self>, slot: Option<TaskSlot>, work: F) -> Result<(), AgentError>
    where
        F: FnOnce() + Send + 'static,
    {
        let agent = Arc::clone(self);
        let accepted = self.pool.submit(Box::new(move || {
            work();
            let mut inner = lock_mutex_recover(&agent.inner);
            inner.thread_active = false;
            agent.changed.notify_all();
        }));
        if accepted {
            return Ok(());
        }

        log::warn!("Thread pool rejected work for agent '{}'", self.name);
        let mut inner = lock_mutex_recover(&self.inner);
        inner.thread_active = false;
        inner.run_started = None;
        if inner.state == AgentState::Running {
            self.return_to_idle(&mut inner);
        }
        if let Some(task) = slot.and_then(|slot| lock_mutex_recover(&slot).take()) {
            inner.current_task = Some(task);
        }
        self.changed.notify_all();
        Err(AgentError::PoolRejected(self.name.clone()))
    }

    /// Run a task description on the calling thread
    pub fn run_sync(&self, description: &str) -> Result<String, AgentError> {
        self.claim_run(false, false)?;
        self.execute(description, None)
    }

    /// Run a task description on the worker pool.
    ///
    /// Publishes `<name>.status`, `<name>.task` and on completion
    /// `<name>.result` or `<name>.error` into shared state. Only one async
    /// run may be in flight per agent.
    pub fn run_async(self: &Arc<Self>, description: impl Into<String>) -> Result<(), AgentError> {
        let description = description.into();
        self.claim_run(false, true)?;

        let agent = Arc::clone(self);
        self.submit_claimed(None, move || {
            let _ = agent.execute_published(&description, None);
        })
    }

    /// Run the assigned task on the calling thread and return it finished.
    ///
    /// Execution failures are recorded on the returned task, not as `Err`.
    pub fn run_assigned(&self) -> Result<Task, AgentError> {
        let task = self.claim_run(true, false)?;
        let slot = Arc::new(Mutex::new(task));
        self.execute_task(slot)
            .ok_or_else(|| AgentError::NoTask(self.name.clone()))
    }

    /// Run the assigned task on the worker pool, handing it to `on_finished`
    pub fn run_assigned_async<F>(self: &Arc<Self>, on_finished: F) -> Result<(), AgentError>
    where
        F: FnOnce(Task) + Send + 'static,
    {
        let task = self.claim_run(true, true)?;
        let slot = Arc::new(Mutex::new(task));

        let agent = Arc::clone(self);
        let job_slot = Arc::clone(&slot);
        self.submit_claimed(Some(slot), move || {
            if let Some(task) = agent.execute_task(job_slot) {
                on_finished(task);
            }
        })
    }

    /// Flag a running agent as paused. The runner itself is not interrupted.
    pub fn pause(&self) -> Result<(), AgentError> {
        let mut inner = lock_mutex_recover(&self.inner);
        if inner.state != AgentState::Running {
            return Err(AgentError::InvalidTransition {
                from: inner.state,
                to: AgentState::Paused,
            });
        }
        self.set_state(&mut inner, AgentState::Paused)
    }

    pub fn resume(&self) -> Result<(), AgentError> {
        let mut inner = lock_mutex_recover(&self.inner);
        if inner.state != AgentState::Paused {
            return Err(AgentError::InvalidTransition {
                from: inner.state,
                to: AgentState::Running,
            });
        }
        self.set_state(&mut inner, AgentState::Running)
    }

    /// Retire an idle agent through `completing` to `completed`
    pub fn complete(&self) -> Result<(), AgentError> {
        let mut inner = lock_mutex_recover(&self.inner);
        if inner.thread_active {
            return Err(AgentError::Busy(self.name.clone()));
        }
        if inner.state != AgentState::Idle {
            return Err(self.not_idle(inner.state));
        }
        self.set_state(&mut inner, AgentState::Completing)?;
        self.set_state(&mut inner, AgentState::Completed)?;
        inner.completed_at = Some(Utc::now());
        log::info!("Agent '{}' completed", self.name);
        Ok(())
    }

    /// Move to the `error` state
    pub fn fail(&self, error: &str) -> Result<(), AgentError> {
        let mut inner = lock_mutex_recover(&self.inner);
        self.set_state(&mut inner, AgentState::Error)?;
        inner.last_error = Some(error.to_string());
        inner.completed_at = Some(Utc::now());
        log::warn!("Agent '{}' failed: {}", self.name, error);
        Ok(())
    }

    /// Terminate children first, then this agent.
    ///
    /// Returns false if the agent had already finished. An in-flight pool
    /// job is not interrupted; it finishes and leaves the state alone.
    pub fn terminate(&self) -> bool {
        for child in self.children() {
            child.terminate();
        }

        let (dropped_task, was_active) = {
            let mut inner = lock_mutex_recover(&self.inner);
            if inner.state.is_finished() {
                return false;
            }
            if self.set_state(&mut inner, AgentState::Terminated).is_err() {
                return false;
            }
            inner.completed_at = Some(Utc::now());
            (inner.current_task.take(), inner.thread_active)
        };

        if let Some(mut task) = dropped_task {
            task.cancel();
        }
        self.runner.shutdown();

        if was_active {
            log::debug!(
                "Agent '{}' terminated with a run still in flight",
                self.name
            );
        }
        log::info!("Agent '{}' terminated", self.name);
        true
    }

    pub fn terminate_children(&self) -> usize {
        self.children()
            .iter()
            .filter(|child| child.terminate())
            .count()
    }

    /// Block until nothing is running on this agent.
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = lock_mutex_recover(&self.inner);
        loop {
            if !inner.thread_active && !is_active_state(inner.state) {
                return true;
            }
            match deadline {
                None => inner = wait_recover(&self.changed, inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    inner = wait_timeout_recover(&self.changed, inner, deadline - now).0;
                }
            }
        }
    }

    /// Wait for every child, sharing one timeout budget
    pub fn wait_children(&self, timeout: Option<Duration>) -> bool {
        wait_for_all(&self.children(), timeout)
    }
}

/// Wait for each agent in turn within a shared deadline
pub(crate) fn wait_for_all(agents: &[Arc<AgentInstance>], timeout: Option<Duration>) -> bool {
    let deadline = timeout.map(|t| Instant::now() + t);
    agents.iter().all(|agent| {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        agent.wait(remaining)
    })
}

impl fmt::Debug for AgentInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentInstance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("agent_type", &self.agent_type)
            .field("state", &self.state())
            .finish()
    }
}
