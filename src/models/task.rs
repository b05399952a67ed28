// Task model: identity, routing, lifecycle and completion callbacks

use super::Capabilities;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub type TaskId = u64;

/// Invoked with the finished task on completion or failure
pub type TaskCallback = Arc<dyn Fn(&Task) + Send + Sync>;

/// Invoked with the task, the new percentage and the progress message
pub type ProgressCallback = Arc<dyn Fn(&Task, u8, &str) + Send + Sync>;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Build,
    Fix,
    Analyze,
    Install,
    Execute,
    Modify,
    Query,
    General,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Build => "build",
            TaskType::Fix => "fix",
            TaskType::Analyze => "analyze",
            TaskType::Install => "install",
            TaskType::Execute => "execute",
            TaskType::Modify => "modify",
            TaskType::Query => "query",
            TaskType::General => "general",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "build" => Ok(TaskType::Build),
            "fix" => Ok(TaskType::Fix),
            "analyze" => Ok(TaskType::Analyze),
            "install" => Ok(TaskType::Install),
            "execute" => Ok(TaskType::Execute),
            "modify" => Ok(TaskType::Modify),
            "query" => Ok(TaskType::Query),
            "general" => Ok(TaskType::General),
            _ => Err(format!("Unknown task type: '{}'", s)),
        }
    }
}

impl Default for TaskType {
    fn default() -> Self {
        TaskType::General
    }
}

/// Scheduling priority. Variant order is significant: higher sorts later.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            _ => Err(format!("Unknown task priority: '{}'", s)),
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Assigned,
    Running,
    WaitingOnChild,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled | TaskState::TimedOut
        )
    }
}

/// A unit of work. Owned by whichever queue or agent currently holds it.
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub state: TaskState,

    pub assigned_agent_id: Option<String>,
    pub preferred_agent: Option<String>,
    pub required_capabilities: Capabilities,

    /// Ids of tasks that must leave the queue before this one is eligible
    pub depends_on: Vec<TaskId>,
    pub dependencies_met: bool,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Advisory deadline in seconds, 0 means unbounded
    pub timeout_sec: u64,

    pub result: Option<String>,
    pub error_message: Option<String>,
    pub exit_code: Option<i32>,

    pub progress_percent: u8,
    pub progress_message: String,

    on_complete: Option<TaskCallback>,
    on_error: Option<TaskCallback>,
    on_progress: Option<ProgressCallback>,

    pub(crate) heap_index: usize,
}

impl Task {
    /// Create a pending general-purpose task with normal priority
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            description: description.into(),
            task_type: TaskType::General,
            priority: TaskPriority::Normal,
            state: TaskState::Pending,
            assigned_agent_id: None,
            preferred_agent: None,
            required_capabilities: Capabilities::empty(),
            depends_on: Vec::new(),
            dependencies_met: true,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            timeout_sec: 0,
            result: None,
            error_message: None,
            exit_code: None,
            progress_percent: 0,
            progress_message: String::new(),
            on_complete: None,
            on_error: None,
            on_progress: None,
            heap_index: 0,
        }
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Add a dependency. Duplicates are allowed and harmless.
    pub fn depends_on(mut self, task_id: TaskId) -> Self {
        self.depends_on.push(task_id);
        self.dependencies_met = false;
        self
    }

    pub fn with_preferred_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.preferred_agent = Some(agent_name.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    pub fn with_timeout(mut self, timeout_sec: u64) -> Self {
        self.timeout_sec = timeout_sec;
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Task, u8, &str) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    /// Record the assignment to an agent
    pub fn mark_assigned(&mut self, agent_id: &str) {
        self.assigned_agent_id = Some(agent_id.to_string());
        self.state = TaskState::Assigned;
    }

    pub fn start(&mut self) {
        self.state = TaskState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, result: impl Into<String>) {
        self.state = TaskState::Completed;
        self.result = Some(result.into());
        self.exit_code = Some(0);
        self.progress_percent = 100;
        self.completed_at = Some(Utc::now());
        if let Some(callback) = self.on_complete.clone() {
            callback(self);
        }
    }

    pub fn fail(&mut self, error: impl Into<String>, exit_code: Option<i32>) {
        self.finish_unsuccessfully(TaskState::Failed, error.into(), exit_code);
    }

    pub fn cancel(&mut self) {
        self.finish_unsuccessfully(TaskState::Cancelled, "Task cancelled".to_string(), None);
    }

    pub fn mark_timed_out(&mut self) {
        let message = format!("Task exceeded timeout of {}s", self.timeout_sec);
        self.finish_unsuccessfully(TaskState::TimedOut, message, None);
    }

    fn finish_unsuccessfully(&mut self, state: TaskState, error: String, exit_code: Option<i32>) {
        self.state = state;
        self.error_message = Some(error);
        self.exit_code = exit_code;
        self.completed_at = Some(Utc::now());
        if let Some(callback) = self.on_error.clone() {
            callback(self);
        }
    }

    /// Update progress. Percent is clamped to 0-100.
    pub fn set_progress(&mut self, percent: u8, message: impl Into<String>) {
        self.progress_percent = percent.min(100);
        self.progress_message = message.into();
        if let Some(callback) = self.on_progress.clone() {
            let message = self.progress_message.clone();
            callback(self, self.progress_percent, &message);
        }
    }

    /// Time since the task started running, zero if it never started
    pub fn elapsed(&self) -> Duration {
        let Some(started) = self.started_at else {
            return Duration::ZERO;
        };
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - started).to_std().unwrap_or(Duration::ZERO)
    }

    /// Advisory: reports whether the deadline has passed, never preempts
    pub fn has_timed_out(&self) -> bool {
        if self.timeout_sec == 0 || self.state.is_finished() {
            return false;
        }
        match self.started_at {
            Some(_) => self.elapsed() > Duration::from_secs(self.timeout_sec),
            None => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Heap comparator: higher priority first, then earlier creation, then lower id
    pub(crate) fn outranks(&self, other: &Task) -> bool {
        if self.priority != other.priority {
            return self.priority > other.priority;
        }
        if self.created_at != other.created_at {
            return self.created_at < other.created_at;
        }
        self.id < other.id
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("task_type", &self.task_type)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("assigned_agent_id", &self.assigned_agent_id)
            .field("preferred_agent", &self.preferred_agent)
            .field("depends_on", &self.depends_on)
            .field("dependencies_met", &self.dependencies_met)
            .field("progress_percent", &self.progress_percent)
            .finish_non_exhaustive()
    }
}
