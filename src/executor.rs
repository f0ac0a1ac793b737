use std::fmt;
use thiserror::Error;
use tokio::runtime::Handle;

/// Unit of background work, typically a maintenance pass.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The executor declined a task; the caller runs the work itself.
#[derive(Error, Debug)]
#[error("task rejected: {reason}")]
pub struct RejectedTask {
    reason: &'static str,
}

impl RejectedTask {
    pub fn new(reason: &'static str) -> Self {
        Self { reason }
    }
}

/// Where maintenance runs when it is scheduled rather than run inline.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task) -> Result<(), RejectedTask>;
}

/// Runs tasks on a Tokio runtime's blocking pool.
#[derive(Clone)]
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Executor for the runtime the caller is running on, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, task: Task) -> Result<(), RejectedTask> {
        // Dropping the join handle detaches the task
        drop(self.handle.spawn_blocking(task));
        Ok(())
    }
}

impl fmt::Debug for TokioExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioExecutor").finish_non_exhaustive()
    }
}

/// Rejects everything, so every scheduled drain runs on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallerRunsExecutor;

impl Executor for CallerRunsExecutor {
    fn execute(&self, _task: Task) -> Result<(), RejectedTask> {
        Err(RejectedTask::new("caller runs"))
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn caller_runs_rejects() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let err = CallerRunsExecutor
            .execute(Box::new(move || flag.store(true, Ordering::SeqCst)))
            .unwrap_err();
        assert!(err.to_string().contains("caller runs"));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn no_tokio_executor_outside_a_runtime() {
        assert!(TokioExecutor::current().is_none());
    }

    #[tokio::test]
    async fn tokio_executor_runs_tasks() {
        let executor = TokioExecutor::current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        executor
            .execute(Box::new(move || {
                let _ = tx.send(7);
            }))
            .unwrap();
        assert_eq!(rx.await.unwrap(), 7);
    }
}
