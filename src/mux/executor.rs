//! Injected background executor.
//!
//! Wraps a Tokio runtime handle with a [`TaskTracker`] so the owner can wait
//! for every task a connection spawned. There is no process-wide default; each
//! [`Mux`](crate::mux::Mux) is given one, explicitly or via [`Executor::current`].

use crate::error::{MuxError, Result};
use std::future::Future;
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone)]
pub struct Executor {
    handle: Handle,
    tracker: TaskTracker,
}

impl Executor {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            tracker: TaskTracker::new(),
        }
    }

    /// Executor bound to the runtime the caller is running on.
    ///
    /// # Errors
    /// `InvalidState` outside a Tokio runtime.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| MuxError::InvalidState(format!("no Tokio runtime: {e}")))
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn_on(task, &self.handle);
    }

    /// Run a synchronous callback on the executor, never inline.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(async move { job() });
    }

    /// Number of tracked tasks still running.
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Close the tracker and wait for every tracked task to finish.
    ///
    /// Tasks belonging to a live connection only finish once it goes down.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_execute_runs_off_caller() {
        let executor = Executor::current().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let counter = counter.clone();
            executor.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        executor.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(executor.active_tasks(), 0);
    }

    #[test]
    fn test_current_outside_runtime() {
        assert!(matches!(Executor::current(), Err(MuxError::InvalidState(_))));
    }
}
