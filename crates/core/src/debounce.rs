//! Debounced task scheduling
//!
//! Coalesces bursts of save requests: each request cancels the previous
//! pending task and schedules a new one after the quiet window.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct Debouncer {
    window: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Debouncer {
            window,
            pending: Mutex::new(None),
        }
    }

    /// Schedule `f` to run after the quiet window, replacing any pending
    /// run. Must be called from within a tokio runtime.
    pub fn maybe_run_async<F>(&self, f: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let window = self.window;
        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            f.await;
        });
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = pending.replace(task) {
            previous.abort();
        }
    }

    /// Drop any pending run without executing it.
    pub fn cancel(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = pending.take() {
            task.abort();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
