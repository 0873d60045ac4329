//! Executors: run tasks on a worker substrate and stream back their outcomes.
//!
//! The runner only sees the [Executor] trait. Three implementations are provided:
//!
//! * [inline::InlineExecutor] runs tasks on the task polling the result stream.
//! * [pool::LocalPoolExecutor] runs tasks on a fixed-size [rayon] thread pool.
//! * [cluster::ClusterExecutor] dispatches tasks to the workers of a
//!   [cluster::ClusterBackend].
//!
//! Transient failures are retried inside the executor according to a [RetryPolicy]. Only the
//! outcome of the last attempt of a task surfaces, except that a successful straggler attempt
//! may be forwarded after a faster attempt of the same partition. The runner discards such
//! duplicates.

pub mod cluster;
pub mod inline;
pub mod pool;
pub mod wire;

use crate::buffers::PartialResult;
use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::metrics;
use crate::resource_manager::ResourceManager;
use crate::task::{RunId, Task, TaskOutcome};

use async_trait::async_trait;
use hashbrown::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;

/// Stream of task outcomes in completion order.
pub type TaskStream = Pin<Box<dyn Stream<Item = TaskOutcome> + Send>>;

/// Trait for executors.
///
/// This forms the contract between the runner and the worker substrate.
#[async_trait]
pub trait Executor: Send + Sync + std::fmt::Debug {
    /// Submit the tasks of a run.
    ///
    /// Returns a stream yielding one final outcome per task, in arbitrary order.
    async fn submit(&self, run_id: RunId, tasks: Vec<Task>) -> Result<TaskStream, EngineError>;

    /// Stop outstanding tasks of a run and release their resources.
    ///
    /// Best effort. Outcomes already yielded remain valid.
    async fn cancel(&self, run_id: RunId);

    /// Stop every run and release the executor's workers.
    async fn close(&self) {}
}

/// Retry and timeout policy of an executor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt
    pub max_retries: u32,
    /// Delay before a retry
    pub backoff: Duration,
    /// Optional limit on the duration of one attempt
    pub task_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Defaults for workers in this process.
    pub fn local() -> Self {
        RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_millis(100),
            task_timeout: None,
        }
    }

    /// Defaults for remote workers.
    pub fn remote() -> Self {
        RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_millis(500),
            task_timeout: Some(Duration::from_secs(600)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::local()
    }
}

/// Error reported for a task whose attempt failed with `error` and which will not be retried.
///
/// Transient errors are wrapped in [EngineError::TaskFailure]; anything else is fatal as is.
pub(crate) fn final_error(task: &Task, error: EngineError) -> EngineError {
    if error.is_retryable() {
        EngineError::TaskFailure {
            task: task.id(),
            partition: task.partition.id,
            attempts: task.attempt + 1,
            source: Box::new(error),
        }
    } else {
        error
    }
}

/// Whether a task that failed with `error` gets another attempt.
pub(crate) fn should_retry(task: &Task, error: &EngineError, policy: &RetryPolicy) -> bool {
    error.is_retryable() && task.attempt < policy.max_retries
}

/// Describe the payload of a caught panic.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Attempts of one task in flight, each yielding the attempt and its result.
type Attempts = JoinSet<(Task, Result<PartialResult, EngineError>)>;

/// Aborts a tokio task when dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Start one attempt of a task in `running`.
///
/// The attempt runs as its own tokio task so that a panic is reported against that attempt.
/// Aborting its entry in `running` aborts the attempt too.
fn spawn_attempt<F>(running: &mut Attempts, task: Task, future: F)
where
    F: Future<Output = Result<PartialResult, EngineError>> + Send + 'static,
{
    running.spawn(async move {
        let handle = tokio::spawn(future);
        let _abort = AbortOnDrop(handle.abort_handle());
        let result = match handle.await {
            Ok(result) => result,
            Err(err) => Err(EngineError::WorkerFailure {
                worker: "supervisor".to_string(),
                reason: match err.try_into_panic() {
                    Ok(panic) => panic_message(panic.as_ref()),
                    Err(err) => err.to_string(),
                },
            }),
        };
        (task, result)
    });
}

/// Run one task until it delivers a result or fails for good, retrying transient failures.
///
/// Each attempt runs as a separate tokio task. When an attempt exceeds the policy's timeout it
/// is counted as failed and a retry starts while the slow attempt keeps running. Returns as soon
/// as one attempt delivers, so that the caller can release the task's resources. Attempts still
/// running at that point are handed to [forward_stragglers].
///
/// # Arguments
///
/// * `task`: First attempt of the task
/// * `policy`: Retry policy
/// * `token`: Cancellation signal of the run
/// * `results`: Channel to forward outcomes to
/// * `attempt`: Function starting one attempt
pub(crate) async fn supervise<A, F>(
    mut task: Task,
    policy: RetryPolicy,
    token: CancelToken,
    results: mpsc::Sender<TaskOutcome>,
    attempt: A,
) where
    A: Fn(Task) -> F,
    F: Future<Output = Result<PartialResult, EngineError>> + Send + 'static,
{
    let mut running: Attempts = JoinSet::new();
    let start = |running: &mut Attempts, task: Task| {
        spawn_attempt(running, task.clone(), attempt(task));
        policy.task_timeout.map(|timeout| Instant::now() + timeout)
    };
    let mut deadline = start(&mut running, task.clone());

    loop {
        let timed_out = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        let (attempt_task, result) = tokio::select! {
            biased;
            _ = token.cancelled() => {
                running.abort_all();
                return;
            }
            joined = running.join_next() => match joined {
                None => return,
                Some(Ok(joined)) => joined,
                // Only this loop aborts attempts, and it returns when it does.
                Some(Err(_)) => continue,
            },
            _ = timed_out => {
                let timeout = policy.task_timeout.unwrap_or_default();
                tracing::warn!(task = %task.id(), ?timeout, "task attempt timed out");
                (
                    task.clone(),
                    Err(EngineError::TaskTimeout {
                        partition: task.partition.id,
                        timeout,
                    }),
                )
            }
        };

        match result {
            Ok(partial) => {
                let outcome = TaskOutcome::new(attempt_task.id(), Ok(partial));
                if results.send(outcome).await.is_err() {
                    running.abort_all();
                    return;
                }
                if !running.is_empty() {
                    tokio::spawn(forward_stragglers(running, token, results));
                }
                return;
            }
            Err(error) if attempt_task.attempt != task.attempt => {
                tracing::debug!(task = %attempt_task.id(), %error, "superseded attempt failed");
            }
            Err(error) if should_retry(&task, &error, &policy) => {
                tracing::warn!(task = %task.id(), %error, "retrying task");
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        running.abort_all();
                        return;
                    }
                    _ = tokio::time::sleep(policy.backoff) => {}
                }
                metrics::TASKS_RETRIED.inc();
                task = task.retry();
                deadline = start(&mut running, task.clone());
            }
            Err(error) => {
                tracing::error!(task = %task.id(), %error, "task failed");
                let outcome = TaskOutcome::new(task.id(), Err(final_error(&task, error)));
                let _ = results.send(outcome).await;
                running.abort_all();
                return;
            }
        }
    }
}

/// Forward the successful results of attempts still running after their task delivered.
///
/// The runner discards them as duplicates. Remaining attempts are aborted when the run is
/// cancelled.
async fn forward_stragglers(
    mut running: Attempts,
    token: CancelToken,
    results: mpsc::Sender<TaskOutcome>,
) {
    loop {
        let joined = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            joined = running.join_next() => joined,
        };
        match joined {
            None => return,
            Some(Ok((task, Ok(partial)))) => {
                tracing::debug!(task = %task.id(), "forwarding straggler result");
                if results
                    .send(TaskOutcome::new(task.id(), Ok(partial)))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Some(Ok((task, Err(error)))) => {
                tracing::debug!(task = %task.id(), %error, "superseded attempt failed");
            }
            Some(Err(_)) => {}
        }
    }
}

/// Handle of a run dispatched by a [RunRegistry].
#[derive(Debug)]
struct RunHandle {
    token: CancelToken,
    dispatcher: AbortHandle,
}

/// Dispatches the tasks of each run under a resource manager and tracks runs for cancellation.
///
/// Shared by the executors whose attempts run as separate tokio tasks.
#[derive(Debug)]
pub(crate) struct RunRegistry {
    policy: RetryPolicy,
    runs: Mutex<HashMap<RunId, RunHandle>>,
}

impl RunRegistry {
    /// Return a new RunRegistry applying `policy` to every task.
    pub(crate) fn new(policy: RetryPolicy) -> Self {
        RunRegistry {
            policy,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Start dispatching the tasks of a run and return its outcome stream.
    ///
    /// # Arguments
    ///
    /// * `run_id`: Run identifier
    /// * `tasks`: Tasks of the run
    /// * `resources`: Bounds tasks in flight and the memory they use
    /// * `capacity`: Capacity of the run's result channel
    /// * `attempt`: Function starting one attempt of a task
    pub(crate) async fn start<A, F>(
        &self,
        run_id: RunId,
        tasks: Vec<Task>,
        resources: Arc<ResourceManager>,
        capacity: usize,
        attempt: A,
    ) -> TaskStream
    where
        A: Fn(Task) -> F + Clone + Send + Sync + 'static,
        F: Future<Output = Result<PartialResult, EngineError>> + Send + 'static,
    {
        let token = CancelToken::new();
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let dispatcher = tokio::spawn(dispatch(
            tasks,
            resources,
            self.policy,
            token.clone(),
            sender,
            attempt,
        ));
        let handle = RunHandle {
            token,
            dispatcher: dispatcher.abort_handle(),
        };
        if let Some(previous) = self.runs.lock().await.insert(run_id, handle) {
            previous.stop();
        }
        Box::pin(ReceiverStream::new(receiver))
    }

    /// Stop a run and forget it.
    pub(crate) async fn cancel(&self, run_id: RunId) {
        if let Some(handle) = self.runs.lock().await.remove(&run_id) {
            tracing::debug!(%run_id, "cancelling run");
            handle.stop();
        }
    }
}

impl RunRegistry {
    /// Stop every run.
    pub(crate) async fn cancel_all(&self) {
        let mut runs = self.runs.lock().await;
        tracing::debug!(runs = runs.len(), "cancelling all runs");
        for (_, handle) in runs.drain() {
            handle.stop();
        }
    }
}

impl RunHandle {
    fn stop(&self) {
        self.token.cancel();
        self.dispatcher.abort();
    }
}

/// Start a supervisor per task once its resources are available, then wait for all of them.
async fn dispatch<A, F>(
    tasks: Vec<Task>,
    resources: Arc<ResourceManager>,
    policy: RetryPolicy,
    token: CancelToken,
    results: mpsc::Sender<TaskOutcome>,
    attempt: A,
) where
    A: Fn(Task) -> F + Clone + Send + Sync + 'static,
    F: Future<Output = Result<PartialResult, EngineError>> + Send + 'static,
{
    let mut supervisors = JoinSet::new();
    for task in tasks {
        let permits = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            permits = resources.task_permits(task.bytes()) => permits,
        };
        match permits {
            Ok(permits) => {
                let token = token.clone();
                let results = results.clone();
                let attempt = attempt.clone();
                supervisors.spawn(async move {
                    supervise(task, policy, token, results, attempt).await;
                    drop(permits);
                });
            }
            Err(error) => {
                tracing::error!(task = %task.id(), %error, "failed to acquire resources");
                let _ = results.send(TaskOutcome::new(task.id(), Err(error))).await;
                break;
            }
        }
    }
    while supervisors.join_next().await.is_some() {}
}
