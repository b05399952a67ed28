//! Worker thread pool used by `run_async`
//!
//! Fixed number of std threads pulling boxed jobs off a shared mpsc channel.
//! A panicking job is caught and logged so the worker survives.

use crate::utils::lock_mutex_recover;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Anything that can run a job on another thread
pub trait ThreadPool: Send + Sync {
    /// Queue a job. Returns false if the pool no longer accepts work.
    fn submit(&self, job: Job) -> bool;
}

pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one)
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .filter_map(|index| spawn_worker(index, receiver.clone()))
            .collect::<Vec<_>>();

        if workers.len() < size {
            log::warn!("Worker pool started {} of {} threads", workers.len(), size);
        } else {
            log::debug!("Worker pool started with {} threads", size);
        }

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_shutdown(&self) -> bool {
        lock_mutex_recover(&self.sender).is_none()
    }

    /// Stop accepting work, let queued jobs drain, and join the workers
    pub fn shutdown(&self) {
        let sender = lock_mutex_recover(&self.sender).take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let workers: Vec<JoinHandle<()>> = lock_mutex_recover(&self.workers).drain(..).collect();
        let current = thread::current().id();
        for worker in workers {
            // A job shutting the pool down cannot join its own thread
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                log::warn!("Worker thread exited with a panic");
            }
        }
        log::debug!("Worker pool shut down");
    }
}

impl ThreadPool for WorkerPool {
    fn submit(&self, job: Job) -> bool {
        match lock_mutex_recover(&self.sender).as_ref() {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(index: usize, receiver: Arc<Mutex<Receiver<Job>>>) -> Option<JoinHandle<()>> {
    let spawned = thread::Builder::new()
        .name(format!("agent-worker-{}", index))
        .spawn(move || loop {
            let job = {
                let receiver = lock_mutex_recover(&receiver);
                receiver.recv()
            };
            match job {
                Ok(job) => {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        log::error!("Job panicked on agent-worker-{}", index);
                    }
                }
                Err(_) => break,
            }
        });

    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            log::error!("Failed to spawn agent-worker-{}: {}", index, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_jobs_run_on_workers() {
        let pool = WorkerPool::new(3);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let counter = counter.clone();
            assert!(pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })));
        }

        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_submit_after_shutdown_rejected() {
        let pool = WorkerPool::new(1);
        pool.shutdown();
        assert!(pool.is_shutdown());
        assert!(!pool.submit(Box::new(|| {})));
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(1);
        let (tx, rx) = mpsc::channel();

        assert!(pool.submit(Box::new(|| panic!("boom"))));
        assert!(pool.submit(Box::new(move || {
            tx.send(7).unwrap();
        })));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn test_zero_size_gets_one_worker() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.size(), 1);
    }
}
