// Graceful shutdown: a shared flag, a cleanup report and signal trapping

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared shutdown state across the runtime
#[derive(Clone)]
pub struct ShutdownState {
    shutdown_requested: Arc<AtomicBool>,
    cleanup_complete: Arc<AtomicBool>,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self {
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            cleanup_complete: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        log::info!("Shutdown requested");
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn mark_cleanup_complete(&self) {
        self.cleanup_complete.store(true, Ordering::SeqCst);
        log::info!("Cleanup complete");
    }

    pub fn is_cleanup_complete(&self) -> bool {
        self.cleanup_complete.load(Ordering::SeqCst)
    }

    /// Block until shutdown is requested or `timeout` elapses.
    ///
    /// Signal handlers only flip an atomic, so this polls at `interval`.
    pub fn wait_for_request(&self, timeout: Option<Duration>, interval: Duration) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.is_shutdown_requested() {
                return true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
            std::thread::sleep(interval);
        }
    }

    /// Reset shutdown state (for testing)
    pub fn reset(&self) {
        self.shutdown_requested.store(false, Ordering::SeqCst);
        self.cleanup_complete.store(false, Ordering::SeqCst);
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

/// What a runtime shutdown cleaned up
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShutdownResult {
    /// Agents that were still live and got terminated
    pub agents_stopped: usize,
    /// Tasks still queued when the queue closed
    pub tasks_dropped: usize,
    /// Whether shared state was written to its persistence file
    pub state_saved: bool,
    pub errors: Vec<String>,
}

impl ShutdownResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if shutdown was clean (no errors)
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct ShutdownHandler {
    state: ShutdownState,
}

impl ShutdownHandler {
    pub fn new() -> Self {
        Self {
            state: ShutdownState::new(),
        }
    }

    pub fn with_state(state: ShutdownState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &ShutdownState {
        &self.state
    }

    /// Run `cleanup_fn` once a shutdown has been requested and log the report
    pub fn handle_shutdown<F>(&self, cleanup_fn: F) -> Result<ShutdownResult>
    where
        F: FnOnce() -> Result<ShutdownResult>,
    {
        self.state.request_shutdown();

        log::info!("Starting graceful shutdown...");

        let result = cleanup_fn()?;

        log::info!(
            "Shutdown complete: {} agents stopped, {} queued tasks dropped, state saved: {}",
            result.agents_stopped,
            result.tasks_dropped,
            result.state_saved
        );

        for error in &result.errors {
            log::warn!("Cleanup error: {}", error);
        }

        self.state.mark_cleanup_complete();

        Ok(result)
    }
}

impl Default for ShutdownHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Register signal handlers for graceful shutdown
/// This sets up handlers for SIGINT (Ctrl+C), SIGTERM, and SIGHUP
#[cfg(unix)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])
        .map_err(|e| anyhow::anyhow!("Failed to register signal handlers: {}", e))?;

    thread::Builder::new()
        .name("shutdown-signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                let name = match signal {
                    SIGINT => "SIGINT (Ctrl+C)",
                    SIGTERM => "SIGTERM",
                    SIGHUP => "SIGHUP",
                    _ => continue,
                };
                log::info!("Received {}", name);
                state.request_shutdown();
            }
        })
        .map_err(|e| anyhow::anyhow!("Failed to start signal thread: {}", e))?;

    log::info!("Signal handlers registered (SIGINT, SIGTERM, SIGHUP)");
    Ok(())
}

/// Register signal handlers for Windows
#[cfg(windows)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C");
        state.request_shutdown();
    })
    .map_err(|e| anyhow::anyhow!("Failed to register Ctrl+C handler: {}", e))?;

    log::info!("Signal handler registered (Ctrl+C)");
    Ok(())
}
