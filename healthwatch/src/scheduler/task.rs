//! Maintenance task units and their execution boundary.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;

use crate::error::{TaskError, panic_message};

/// A named, zero-argument unit of retryable asynchronous work.
#[async_trait]
pub trait MaintenanceTask: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<(), TaskError>;
}

/// Shared handle to a queued task. Re-enqueueing a failed task re-uses the same handle.
pub type TaskRef = Arc<dyn MaintenanceTask>;

/// A [`MaintenanceTask`] built from a closure returning a future.
pub struct FnTask<F> {
    name: String,
    func: F,
}

impl<F> FnTask<F> {
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> std::fmt::Debug for FnTask<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTask").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F, Fut> MaintenanceTask for FnTask<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> Result<(), TaskError> {
        (self.func)().await
    }
}

/// Run one attempt of `task`.
///
/// Panics become [`TaskError::Panicked`] and an elapsed `timeout` becomes
/// [`TaskError::TimedOut`], so every outcome is an ordinary retry-eligible result.
pub async fn execute(task: &dyn MaintenanceTask, timeout: Option<Duration>) -> Result<(), TaskError> {
    let attempt = AssertUnwindSafe(task.run()).catch_unwind();

    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(TaskError::TimedOut(limit)),
        },
        None => attempt.await,
    };

    match outcome {
        Ok(result) => result,
        Err(payload) => Err(TaskError::Panicked(panic_message(payload))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_task_success_and_failure() {
        let ok = FnTask::new("ok", || async { Ok(()) });
        assert_eq!(ok.name(), "ok");
        assert!(execute(&ok, None).await.is_ok());

        let failing = FnTask::new("failing", || async { Err(TaskError::failed("disk check")) });
        assert_eq!(
            execute(&failing, None).await,
            Err(TaskError::Failed("disk check".to_string()))
        );
    }

    #[tokio::test]
    async fn test_panic_is_caught() {
        let task = FnTask::new("panics", || async {
            if true {
                panic!("boom");
            }
            Ok(())
        });
        assert_eq!(
            execute(&task, None).await,
            Err(TaskError::Panicked("boom".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_reported() {
        let task = FnTask::new("slow", || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        });
        assert_eq!(
            execute(&task, Some(Duration::from_secs(2))).await,
            Err(TaskError::TimedOut(Duration::from_secs(2)))
        );
    }
}
