//! Executor running tasks on the task that polls the result stream.

use super::{final_error, panic_message, should_retry, Executor, RetryPolicy, TaskStream};
use crate::buffers::PartialResult;
use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::task::{RunId, Task, TaskOutcome};

use async_trait::async_trait;
use hashbrown::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::Mutex;
use tokio_stream::StreamExt;

/// Executes each task when the stream is polled, in submission order.
///
/// Useful for debugging and tests. Retries happen immediately, without backoff, and task
/// timeouts do not apply.
#[derive(Debug, Default)]
pub struct InlineExecutor {
    policy: RetryPolicy,
    runs: Mutex<HashMap<RunId, CancelToken>>,
}

impl InlineExecutor {
    /// Return a new InlineExecutor.
    pub fn new(policy: RetryPolicy) -> Self {
        InlineExecutor {
            policy,
            runs: Mutex::new(HashMap::new()),
        }
    }
}

/// Execute one attempt, turning a panic into a worker failure.
fn attempt(task: &Task) -> Result<PartialResult, EngineError> {
    catch_unwind(AssertUnwindSafe(|| task.execute())).unwrap_or_else(|panic| {
        Err(EngineError::WorkerFailure {
            worker: "inline".to_string(),
            reason: panic_message(panic.as_ref()),
        })
    })
}

/// Execute a task to its final outcome.
fn run_to_completion(mut task: Task, policy: &RetryPolicy) -> TaskOutcome {
    loop {
        match attempt(&task) {
            Ok(partial) => return TaskOutcome::new(task.id(), Ok(partial)),
            Err(error) if should_retry(&task, &error, policy) => {
                tracing::warn!(task = %task.id(), %error, "retrying task");
                crate::metrics::TASKS_RETRIED.inc();
                task = task.retry();
            }
            Err(error) => {
                tracing::error!(task = %task.id(), %error, "task failed");
                return TaskOutcome::new(task.id(), Err(final_error(&task, error)));
            }
        }
    }
}

#[async_trait]
impl Executor for InlineExecutor {
    async fn submit(&self, run_id: RunId, tasks: Vec<Task>) -> Result<TaskStream, EngineError> {
        let token = CancelToken::new();
        self.runs.lock().await.insert(run_id, token.clone());
        let policy = self.policy;
        let stream = tokio_stream::iter(tasks)
            .take_while(move |_| !token.is_cancelled())
            .map(move |task| run_to_completion(task, &policy));
        Ok(Box::pin(stream))
    }

    async fn cancel(&self, run_id: RunId) {
        if let Some(token) = self.runs.lock().await.remove(&run_id) {
            token.cancel();
        }
    }
}
