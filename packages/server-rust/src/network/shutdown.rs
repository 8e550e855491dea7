//! Shutdown coordination with tracked-task accounting.
//!
//! A watch channel signals shutdown to every long-lived task (event loop,
//! delivery workers, drain tasks); an atomic counter with RAII guards
//! tracks how many of them are still running so `stop` can wait for a
//! clean exit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Coordinates graceful shutdown across the broker's tasks.
#[derive(Debug)]
pub struct ShutdownController {
    signal: watch::Sender<bool>,
    active: Arc<AtomicU64>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (signal, _rx) = watch::channel(false);
        Self {
            signal,
            active: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A receiver that resolves once shutdown is triggered.
    ///
    /// Long-lived tasks select on this alongside their input queue.
    #[must_use]
    pub fn receiver(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Signal all receivers to stop consuming new input.
    pub fn trigger(&self) {
        // Send errors mean every receiver is already gone.
        let _ = self.signal.send(true);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.signal.borrow()
    }

    /// RAII guard counting one running task.
    ///
    /// The counter is decremented on drop, including during unwinding, so
    /// a panicking worker never wedges `wait_idle`.
    #[must_use]
    pub fn task_guard(&self) -> TaskGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        TaskGuard {
            active: Arc::clone(&self.active),
        }
    }

    /// Number of tracked tasks still running.
    #[must_use]
    pub fn task_count(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Wait for all tracked tasks to finish, up to `timeout`.
    ///
    /// Returns `false` when the deadline passes with tasks still running.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.active.load(Ordering::Relaxed) == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            // Poll at 10ms intervals to avoid busy-waiting
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the tracked-task counter when dropped.
#[derive(Debug)]
pub struct TaskGuard {
    active: Arc<AtomicU64>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}
