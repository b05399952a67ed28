//! Priority task queue with dependency gating
//!
//! An array-backed binary max-heap of owned [`Task`]s behind a mutex, with a
//! "not empty" condition variable for blocking consumers. Ordering is
//! priority descending, then `created_at` ascending (FIFO within a band).
//!
//! Every task records its position in `heap_index`, so arbitrary removal
//! (`remove`/`cancel`) costs one O(n) lookup plus an O(log n) re-heapify.

use crate::models::{Capabilities, Task, TaskId};
use crate::utils::{lock_mutex_recover, wait_recover, wait_timeout_recover};
use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Initial heap capacity; the heap grows as needed
pub const DEFAULT_INITIAL_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Task queue is shut down")]
    Shutdown,

    #[error("Timed out waiting for a task")]
    TimedOut,

    #[error("Task queue is empty")]
    Empty,

    #[error("Task {0} is not in the queue")]
    NotFound(TaskId),
}

struct HeapInner {
    items: Vec<Task>,
    shutdown: bool,
}

impl HeapInner {
    fn swap(&mut self, a: usize, b: usize) {
        self.items.swap(a, b);
        self.items[a].heap_index = a;
        self.items[b].heap_index = b;
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.items[idx].outranks(&self.items[parent]) {
                self.swap(idx, parent);
                idx = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            let mut best = idx;

            if left < len && self.items[left].outranks(&self.items[best]) {
                best = left;
            }
            if right < len && self.items[right].outranks(&self.items[best]) {
                best = right;
            }
            if best == idx {
                break;
            }
            self.swap(idx, best);
            idx = best;
        }
    }

    fn insert(&mut self, mut task: Task) {
        let idx = self.items.len();
        task.heap_index = idx;
        self.items.push(task);
        self.sift_up(idx);
    }

    /// Remove the task at `idx`, moving the last element into the hole
    fn remove_at(&mut self, idx: usize) -> Option<Task> {
        let last = self.items.len().checked_sub(1)?;
        if idx > last {
            return None;
        }
        if idx != last {
            self.swap(idx, last);
        }
        let task = self.items.pop()?;
        if idx < self.items.len() {
            self.sift_down(idx);
            self.sift_up(idx);
        }
        Some(task)
    }

    fn position(&self, task_id: TaskId) -> Option<usize> {
        self.items.iter().position(|t| t.id == task_id)
    }

    fn queued_ids(&self) -> HashSet<TaskId> {
        self.items.iter().map(|t| t.id).collect()
    }
}

/// A dependency is met once it no longer identifies a queued task.
/// Completion and cancellation are indistinguishable here.
fn deps_met(task: &Task, queued: &HashSet<TaskId>) -> bool {
    task.depends_on.iter().all(|dep| !queued.contains(dep))
}

/// Thread-safe priority queue of owned tasks
pub struct TaskQueue {
    inner: Mutex<HeapInner>,
    not_empty: Condvar,
}

impl TaskQueue {
    /// Create an empty queue with the default initial capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HeapInner {
                items: Vec::with_capacity(capacity.max(1)),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Insert a task. Rejected once the queue has been shut down.
    pub fn push(&self, mut task: Task) -> Result<(), QueueError> {
        let mut inner = lock_mutex_recover(&self.inner);
        if inner.shutdown {
            log::debug!("Rejected task {} pushed to shut down queue", task.id);
            return Err(QueueError::Shutdown);
        }

        let queued = inner.queued_ids();
        task.dependencies_met = deps_met(&task, &queued);
        log::debug!(
            "Queued task {} ({}, {})",
            task.id,
            task.priority,
            task.task_type
        );
        inner.insert(task);
        drop(inner);

        self.not_empty.notify_one();
        Ok(())
    }

    /// Block until a task is available. Returns `None` once shut down.
    pub fn pop(&self) -> Option<Task> {
        let mut inner = lock_mutex_recover(&self.inner);
        loop {
            if inner.shutdown {
                return None;
            }
            if let Some(task) = inner.remove_at(0) {
                return Some(task);
            }
            inner = wait_recover(&self.not_empty, inner);
        }
    }

    /// Block for at most `timeout_ms` milliseconds waiting for a task
    pub fn pop_with_timeout(&self, timeout_ms: u64) -> Result<Task, QueueError> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut inner = lock_mutex_recover(&self.inner);
        loop {
            if inner.shutdown {
                return Err(QueueError::Shutdown);
            }
            if let Some(task) = inner.remove_at(0) {
                return Ok(task);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(QueueError::TimedOut);
            }
            let (guard, _) = wait_timeout_recover(&self.not_empty, inner, deadline - now);
            inner = guard;
        }
    }

    /// Non-blocking pop
    pub fn try_pop(&self) -> Option<Task> {
        let mut inner = lock_mutex_recover(&self.inner);
        if inner.shutdown {
            return None;
        }
        inner.remove_at(0)
    }

    /// Remove the first task this agent may run.
    ///
    /// Entries are scanned in heap-array order, not global priority order:
    /// the result is the first eligible match found, which is only the
    /// highest-priority eligible task when nothing ahead of it was skipped.
    pub fn pop_for_agent(&self, agent_name: &str, capabilities: Capabilities) -> Option<Task> {
        let mut inner = lock_mutex_recover(&self.inner);
        if inner.shutdown {
            return None;
        }

        let queued = inner.queued_ids();
        let idx = inner.items.iter().position(|task| {
            capabilities.contains(task.required_capabilities)
                && task
                    .preferred_agent
                    .as_deref()
                    .map_or(true, |preferred| preferred == agent_name)
                && deps_met(task, &queued)
        })?;

        let mut task = inner.remove_at(idx)?;
        task.dependencies_met = true;
        log::debug!("Task {} matched agent '{}'", task.id, agent_name);
        Some(task)
    }

    /// Remove a task by id
    pub fn remove(&self, task_id: TaskId) -> Option<Task> {
        let mut inner = lock_mutex_recover(&self.inner);
        let idx = inner.position(task_id)?;
        inner.remove_at(idx)
    }

    /// Remove a task and mark it cancelled (fires its error callback)
    pub fn cancel(&self, task_id: TaskId) -> Result<Task, QueueError> {
        let mut task = self.remove(task_id).ok_or(QueueError::NotFound(task_id))?;
        task.cancel();
        log::info!("Cancelled task {}", task_id);
        Ok(task)
    }

    /// True iff none of the task's dependencies is still queued
    pub fn dependencies_met(&self, task: &Task) -> bool {
        let inner = lock_mutex_recover(&self.inner);
        deps_met(task, &inner.queued_ids())
    }

    /// Re-derive `dependencies_met` for every queued task.
    ///
    /// Returns how many tasks became eligible.
    pub fn update_dependencies(&self, completed_task_id: TaskId) -> usize {
        let mut inner = lock_mutex_recover(&self.inner);
        let queued = inner.queued_ids();

        let mut unblocked = 0;
        for task in inner.items.iter_mut() {
            let met = deps_met(task, &queued);
            if met && !task.dependencies_met {
                unblocked += 1;
            }
            task.dependencies_met = met;
        }

        if unblocked > 0 {
            log::debug!(
                "Completion of task {} unblocked {} task(s)",
                completed_task_id,
                unblocked
            );
        }
        unblocked
    }

    /// Look up a queued task's `dependencies_met` flag
    pub fn is_ready(&self, task_id: TaskId) -> Option<bool> {
        let inner = lock_mutex_recover(&self.inner);
        inner
            .position(task_id)
            .map(|idx| inner.items[idx].dependencies_met)
    }

    pub fn len(&self) -> usize {
        lock_mutex_recover(&self.inner).items.len()
    }

    pub fn is_empty(&self) -> bool {
        lock_mutex_recover(&self.inner).items.is_empty()
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        lock_mutex_recover(&self.inner).position(task_id).is_some()
    }

    /// Id of the task `pop` would return next
    pub fn peek_id(&self) -> Option<TaskId> {
        lock_mutex_recover(&self.inner).items.first().map(|t| t.id)
    }

    /// Queued ids in heap-array order
    pub fn ids(&self) -> Vec<TaskId> {
        lock_mutex_recover(&self.inner)
            .items
            .iter()
            .map(|t| t.id)
            .collect()
    }

    /// Drop every queued task, returning how many were removed
    pub fn clear(&self) -> usize {
        let mut inner = lock_mutex_recover(&self.inner);
        let count = inner.items.len();
        inner.items.clear();
        count
    }

    /// One-way shutdown: wakes every blocked consumer
    pub fn shutdown(&self) {
        {
            let mut inner = lock_mutex_recover(&self.inner);
            if inner.shutdown {
                return;
            }
            inner.shutdown = true;
        }
        log::info!("Task queue shut down");
        self.not_empty.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        lock_mutex_recover(&self.inner).shutdown
    }

    #[cfg(test)]
    fn heap_is_valid(&self) -> bool {
        let inner = lock_mutex_recover(&self.inner);
        inner.items.iter().enumerate().all(|(idx, task)| {
            let parent_ok = idx == 0 || !task.outranks(&inner.items[(idx - 1) / 2]);
            parent_ok && task.heap_index == idx
        })
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TaskPriority, TaskState};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn task(priority: TaskPriority) -> Task {
        Task::new(format!("{} task", priority)).with_priority(priority)
    }

    #[test]
    fn test_pop_orders_by_priority() {
        let queue = TaskQueue::new();
        queue.push(task(TaskPriority::Low)).unwrap();
        queue.push(task(TaskPriority::Critical)).unwrap();
        queue.push(task(TaskPriority::Normal)).unwrap();

        assert_eq!(queue.pop().unwrap().priority, TaskPriority::Critical);
        assert_eq!(queue.pop().unwrap().priority, TaskPriority::Normal);
        assert_eq!(queue.pop().unwrap().priority, TaskPriority::Low);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_fifo_within_priority_band() {
        let queue = TaskQueue::new();
        let ids: Vec<TaskId> = (0..5)
            .map(|_| {
                let t = task(TaskPriority::High);
                let id = t.id;
                queue.push(t).unwrap();
                id
            })
            .collect();

        let popped: Vec<TaskId> = (0..5).map(|_| queue.pop().unwrap().id).collect();
        assert_eq!(popped, ids);
    }

    #[test]
    fn test_growth_is_lossless() {
        let queue = TaskQueue::with_capacity(2);
        let priorities = [
            TaskPriority::Low,
            TaskPriority::Normal,
            TaskPriority::High,
            TaskPriority::Critical,
        ];
        let mut expected = HashSet::new();
        for i in 0..100 {
            let t = task(priorities[i % 4]);
            expected.insert(t.id);
            queue.push(t).unwrap();
        }
        assert!(queue.heap_is_valid());
        assert_eq!(queue.len(), 100);

        let mut seen = HashSet::new();
        let mut last_priority = TaskPriority::Critical;
        while let Some(t) = queue.try_pop() {
            assert!(t.priority <= last_priority);
            last_priority = t.priority;
            assert!(seen.insert(t.id), "task {} popped twice", t.id);
        }
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_remove_keeps_heap_valid() {
        let queue = TaskQueue::new();
        let mut ids = Vec::new();
        for i in 0..20 {
            let priority = if i % 3 == 0 {
                TaskPriority::High
            } else {
                TaskPriority::Low
            };
            let t = task(priority);
            ids.push(t.id);
            queue.push(t).unwrap();
        }

        for id in ids.iter().step_by(2) {
            assert!(queue.remove(*id).is_some());
            assert!(queue.heap_is_valid());
        }
        assert_eq!(queue.len(), 10);
        assert!(queue.remove(ids[0]).is_none());
    }

    #[test]
    fn test_cancel_marks_task_and_fires_callback() {
        let queue = TaskQueue::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let t = Task::new("cancel me").on_error(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let id = t.id;
        queue.push(t).unwrap();

        let cancelled = queue.cancel(id).unwrap();
        assert_eq!(cancelled.state, TaskState::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.cancel(id).unwrap_err(), QueueError::NotFound(id));
    }

    #[test]
    fn test_push_after_shutdown_rejected() {
        let queue = TaskQueue::new();
        queue.push(Task::new("queued")).unwrap();
        queue.shutdown();
        assert_eq!(
            queue.push(Task::new("late")).unwrap_err(),
            QueueError::Shutdown
        );
        assert!(queue.pop().is_none());
        assert!(queue.try_pop().is_none());
        assert_eq!(queue.pop_with_timeout(10).unwrap_err(), QueueError::Shutdown);
    }

    #[test]
    fn test_shutdown_wakes_blocked_pop() {
        let queue = Arc::new(TaskQueue::new());
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };

        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        queue.shutdown();

        let result = consumer.join().unwrap();
        assert!(result.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_blocked_pop_receives_pushed_task() {
        let queue = Arc::new(TaskQueue::new());
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop_with_timeout(2_000))
        };

        thread::sleep(Duration::from_millis(20));
        let t = Task::new("late arrival");
        let id = t.id;
        queue.push(t).unwrap();

        assert_eq!(consumer.join().unwrap().unwrap().id, id);
    }

    #[test]
    fn test_pop_with_timeout_times_out() {
        let queue = TaskQueue::new();
        let started = Instant::now();
        assert_eq!(queue.pop_with_timeout(30).unwrap_err(), QueueError::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_dependency_gating() {
        let queue = TaskQueue::new();
        let a = Task::new("A");
        let a_id = a.id;
        queue.push(a).unwrap();

        let b = Task::new("B").depends_on(a_id);
        let b_id = b.id;
        let candidate = Task::new("waiting").depends_on(a_id);
        queue.push(b).unwrap();

        assert!(!queue.dependencies_met(&candidate));
        assert_eq!(queue.is_ready(b_id), Some(false));

        // B is not eligible for an agent while A is queued
        let first = queue.pop_for_agent("worker", Capabilities::all()).unwrap();
        assert_eq!(first.id, a_id);

        assert!(queue.dependencies_met(&candidate));
        assert_eq!(queue.update_dependencies(a_id), 1);
        assert_eq!(queue.is_ready(b_id), Some(true));
    }

    #[test]
    fn test_cancelled_dependency_counts_as_met() {
        let queue = TaskQueue::new();
        let a = Task::new("A");
        let a_id = a.id;
        queue.push(a).unwrap();
        let candidate = Task::new("B").depends_on(a_id).depends_on(a_id);

        assert!(!queue.dependencies_met(&candidate));
        queue.cancel(a_id).unwrap();
        assert!(queue.dependencies_met(&candidate));
    }

    #[test]
    fn test_pop_for_agent_filters_capabilities_and_preference() {
        let queue = TaskQueue::new();
        let needs_build = Task::new("build").with_capabilities(Capabilities::BUILD);
        let for_bob = Task::new("bob only").with_preferred_agent("bob");
        let build_id = needs_build.id;
        let bob_id = for_bob.id;
        queue.push(needs_build).unwrap();
        queue.push(for_bob).unwrap();

        assert!(queue
            .pop_for_agent("alice", Capabilities::READ_FILES)
            .is_none());
        assert_eq!(
            queue.pop_for_agent("bob", Capabilities::READ_FILES).unwrap().id,
            bob_id
        );
        assert_eq!(
            queue.pop_for_agent("alice", Capabilities::BUILD).unwrap().id,
            build_id
        );
    }

    #[test]
    fn test_pop_for_agent_uses_heap_array_order() {
        // Heap array after these pushes: [critical(spawn), low, high].
        // An agent without SPAWN skips the root and takes the first eligible
        // entry in storage order (low), not the best eligible one (high).
        let queue = TaskQueue::new();
        queue
            .push(task(TaskPriority::Critical).with_capabilities(Capabilities::SPAWN))
            .unwrap();
        let low = task(TaskPriority::Low);
        let low_id = low.id;
        queue.push(low).unwrap();
        queue.push(task(TaskPriority::High)).unwrap();

        let picked = queue
            .pop_for_agent("worker", Capabilities::READ_FILES)
            .unwrap();
        assert_eq!(picked.id, low_id);
        assert!(queue.heap_is_valid());
    }

    #[test]
    fn test_peek_and_clear() {
        let queue = TaskQueue::new();
        assert!(queue.peek_id().is_none());
        let t = task(TaskPriority::Critical);
        let id = t.id;
        queue.push(task(TaskPriority::Low)).unwrap();
        queue.push(t).unwrap();
        assert_eq!(queue.peek_id(), Some(id));
        assert!(queue.contains(id));
        assert_eq!(queue.ids().len(), 2);
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }
}
