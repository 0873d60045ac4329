//! Executor dispatching tasks to the workers of a compute cluster.

use super::{panic_message, wire, Executor, RetryPolicy, RunRegistry, TaskStream};
use crate::buffers::PartialResult;
use crate::error::EngineError;
use crate::resource_manager::ResourceManager;
use crate::task::{RunId, Task};

use async_trait::async_trait;
use hashbrown::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_rayon::AsyncThreadPool;

/// Errors reported by a [ClusterBackend].
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The worker went away while running the task
    #[error("worker {worker} lost")]
    WorkerLost { worker: String },

    /// The task ran and failed
    #[error(transparent)]
    Task(#[from] EngineError),

    /// The task or its result could not be transferred
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<ClusterError> for EngineError {
    fn from(error: ClusterError) -> Self {
        match error {
            ClusterError::WorkerLost { worker } => EngineError::WorkerFailure {
                worker,
                reason: "worker lost".to_string(),
            },
            ClusterError::Task(error) => error,
            ClusterError::Transport(reason) => EngineError::WorkerFailure {
                worker: "transport".to_string(),
                reason,
            },
        }
    }
}

/// Trait for cluster-compute backends.
///
/// A backend knows which workers are alive and runs a task on a named worker.
#[async_trait]
pub trait ClusterBackend: Send + Sync + std::fmt::Debug {
    /// Names of the workers currently alive.
    async fn live_workers(&self) -> Vec<String>;

    /// Run a task on a worker and return its partial result.
    async fn execute(&self, worker: &str, task: Task) -> Result<PartialResult, ClusterError>;

    /// Shut the workers down.
    async fn close(&self) {}
}

/// How long a worker reported lost is passed over while other workers are available.
const LOST_WORKER_QUARANTINE: Duration = Duration::from_secs(30);

/// Round-robin worker choice.
///
/// The candidates always come from the backend's live workers. A worker reported lost is passed
/// over while other candidates are available, until its quarantine expires or it completes a
/// task.
#[derive(Debug)]
struct Rotation {
    lost: Mutex<HashMap<String, Instant>>,
    quarantine: Duration,
    next: AtomicUsize,
}

impl Default for Rotation {
    fn default() -> Self {
        Rotation {
            lost: Mutex::new(HashMap::new()),
            quarantine: LOST_WORKER_QUARANTINE,
            next: AtomicUsize::new(0),
        }
    }
}

impl Rotation {
    /// Pick the next worker among `candidates`, preferring those not recently lost.
    fn pick(&self, candidates: &[String]) -> Option<String> {
        let preferred: Vec<&String> = match self.lost.lock() {
            Ok(mut lost) => {
                lost.retain(|_, since| since.elapsed() < self.quarantine);
                candidates
                    .iter()
                    .filter(|worker| !lost.contains_key(worker.as_str()))
                    .collect()
            }
            Err(_) => candidates.iter().collect(),
        };
        let workers: Vec<&String> = if preferred.is_empty() {
            candidates.iter().collect()
        } else {
            preferred
        };
        if workers.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % workers.len();
        Some(workers[index].clone())
    }

    /// Pass over a worker for a while.
    fn lose(&self, worker: &str) {
        if let Ok(mut lost) = self.lost.lock() {
            lost.insert(worker.to_string(), Instant::now());
        }
    }

    /// Return a worker to rotation.
    fn recover(&self, worker: &str) {
        if let Ok(mut lost) = self.lost.lock() {
            if lost.remove(worker).is_some() {
                tracing::info!(%worker, "worker back in rotation");
            }
        }
    }
}

/// Live workers that may run a task.
fn candidates(live: Vec<String>, task: &Task) -> Vec<String> {
    match &task.partition.locations {
        None => live,
        Some(locations) => live
            .into_iter()
            .filter(|worker| locations.contains(worker))
            .collect(),
    }
}

/// Dispatches tasks to the workers of a [ClusterBackend].
///
/// Workers are chosen round-robin among the live workers, restricted to a partition's locations
/// when it has any. At most `live workers × tasks_per_worker` tasks are in flight per run. A
/// worker reported lost is passed over for a while, and the task is retried on another worker.
#[derive(Debug)]
pub struct ClusterExecutor {
    backend: Arc<dyn ClusterBackend>,
    tasks_per_worker: usize,
    rotation: Arc<Rotation>,
    registry: RunRegistry,
}

impl ClusterExecutor {
    /// Return a new ClusterExecutor.
    ///
    /// # Arguments
    ///
    /// * `backend`: Cluster backend
    /// * `tasks_per_worker`: Number of tasks in flight per live worker
    /// * `policy`: Retry policy
    pub fn new(
        backend: Arc<dyn ClusterBackend>,
        tasks_per_worker: usize,
        policy: RetryPolicy,
    ) -> Result<Self, EngineError> {
        if tasks_per_worker == 0 {
            return Err(EngineError::configuration(
                "tasks per worker must be positive",
            ));
        }
        Ok(ClusterExecutor {
            backend,
            tasks_per_worker,
            rotation: Arc::new(Rotation::default()),
            registry: RunRegistry::new(policy),
        })
    }
}

/// Run one attempt on the next worker in rotation.
async fn attempt(
    backend: Arc<dyn ClusterBackend>,
    rotation: Arc<Rotation>,
    task: Task,
) -> Result<PartialResult, EngineError> {
    let workers = candidates(backend.live_workers().await, &task);
    let worker = rotation
        .pick(&workers)
        .ok_or_else(|| EngineError::WorkerFailure {
            worker: "cluster".to_string(),
            reason: match &task.partition.locations {
                Some(locations) => format!("no live worker among {:?}", locations),
                None => "no live workers".to_string(),
            },
        })?;
    tracing::debug!(task = %task.id(), %worker, "dispatching task");
    match backend.execute(&worker, task).await {
        Ok(partial) => {
            rotation.recover(&worker);
            Ok(partial)
        }
        Err(ClusterError::WorkerLost { worker }) => {
            tracing::warn!(%worker, "passing over lost worker");
            rotation.lose(&worker);
            Err(ClusterError::WorkerLost { worker }.into())
        }
        Err(error) => Err(error.into()),
    }
}

#[async_trait]
impl Executor for ClusterExecutor {
    async fn submit(&self, run_id: RunId, tasks: Vec<Task>) -> Result<TaskStream, EngineError> {
        if let Some(task) = tasks.iter().find(|task| {
            matches!(&task.partition.locations, Some(locations) if locations.is_empty())
        }) {
            return Err(EngineError::configuration(format!(
                "no workers found for task {}",
                task.id()
            )));
        }
        let workers = self.backend.live_workers().await;
        if workers.is_empty() {
            return Err(EngineError::configuration("cluster has no live workers"));
        }
        let in_flight = workers.len() * self.tasks_per_worker;
        tracing::info!(workers = workers.len(), in_flight, "submitting run to cluster");
        let resources = Arc::new(ResourceManager::new(None, Some(in_flight)));
        let backend = self.backend.clone();
        let rotation = self.rotation.clone();
        let stream = self
            .registry
            .start(run_id, tasks, resources, in_flight, move |task| {
                attempt(backend.clone(), rotation.clone(), task)
            })
            .await;
        Ok(stream)
    }

    async fn cancel(&self, run_id: RunId) {
        self.registry.cancel(run_id).await
    }

    async fn close(&self) {
        self.registry.cancel_all().await;
        self.backend.close().await;
    }
}

/// One worker of a [LocalCluster].
#[derive(Debug)]
struct LocalWorker {
    name: String,
    pool: Arc<rayon::ThreadPool>,
    alive: Arc<AtomicBool>,
}

/// In-process cluster backend with named workers, each owning a thread pool.
///
/// Partial results cross a [wire] encoding on their way back, as they would from a remote
/// worker. Stopping a worker makes it report its tasks as lost.
#[derive(Debug)]
pub struct LocalCluster {
    workers: Vec<LocalWorker>,
}

impl LocalCluster {
    /// Start a cluster of `workers` workers named `worker-0`, `worker-1`, ...
    pub fn new(workers: usize, threads_per_worker: usize) -> Result<Self, EngineError> {
        if workers == 0 || threads_per_worker == 0 {
            return Err(EngineError::configuration(
                "local cluster needs at least one worker with one thread",
            ));
        }
        let workers = (0..workers)
            .map(|index| {
                let name = format!("worker-{}", index);
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads_per_worker)
                    .thread_name({
                        let name = name.clone();
                        move |thread| format!("stackmerge-{}-{}", name, thread)
                    })
                    .build()
                    .map_err(|err| {
                        EngineError::configuration(format!("cannot start {}: {}", name, err))
                    })?;
                Ok(LocalWorker {
                    name,
                    pool: Arc::new(pool),
                    alive: Arc::new(AtomicBool::new(true)),
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;
        Ok(LocalCluster { workers })
    }

    /// Stop a worker. Tasks running on it are reported lost.
    pub fn stop_worker(&self, name: &str) -> bool {
        match self.worker(name) {
            Some(worker) => {
                tracing::info!(worker = name, "stopping worker");
                worker.alive.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Stop every worker.
    pub fn shutdown(&self) {
        tracing::info!(workers = self.workers.len(), "shutting down local cluster");
        for worker in &self.workers {
            worker.alive.store(false, Ordering::SeqCst);
        }
    }

    fn worker(&self, name: &str) -> Option<&LocalWorker> {
        self.workers.iter().find(|worker| worker.name == name)
    }
}

#[async_trait]
impl ClusterBackend for LocalCluster {
    async fn live_workers(&self) -> Vec<String> {
        self.workers
            .iter()
            .filter(|worker| worker.alive.load(Ordering::SeqCst))
            .map(|worker| worker.name.clone())
            .collect()
    }

    async fn close(&self) {
        self.shutdown()
    }

    async fn execute(&self, name: &str, task: Task) -> Result<PartialResult, ClusterError> {
        let worker = self
            .worker(name)
            .ok_or_else(|| ClusterError::Transport(format!("unknown worker {}", name)))?;
        let lost = || ClusterError::WorkerLost {
            worker: name.to_string(),
        };
        if !worker.alive.load(Ordering::SeqCst) {
            return Err(lost());
        }
        let worker_name = worker.name.clone();
        let message = worker
            .pool
            .spawn_async(move || {
                catch_unwind(AssertUnwindSafe(|| task.execute()))
                    .unwrap_or_else(|panic| {
                        Err(EngineError::WorkerFailure {
                            worker: worker_name,
                            reason: panic_message(panic.as_ref()),
                        })
                    })
                    .and_then(|partial| wire::encode(&partial))
            })
            .await?;
        if !worker.alive.load(Ordering::SeqCst) {
            return Err(lost());
        }
        Ok(wire::decode(message)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::task::TaskOutcome;
    use crate::test_utils;
    use std::fmt;
    use tokio_stream::StreamExt;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            backoff: Duration::from_millis(1),
            task_timeout: None,
        }
    }

    /// What a [ScriptedBackend] does with a task.
    enum Behaviour {
        Run,
        Lose,
        Hang,
    }

    type Script = Box<dyn Fn(&str, &Task) -> Behaviour + Send + Sync>;

    /// Backend whose workers follow a script.
    struct ScriptedBackend {
        workers: Vec<String>,
        script: Script,
        calls: Mutex<HashMap<String, usize>>,
    }

    impl fmt::Debug for ScriptedBackend {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("ScriptedBackend")
                .field("workers", &self.workers)
                .finish()
        }
    }

    impl ScriptedBackend {
        fn new<F>(workers: &[&str], script: F) -> Arc<Self>
        where
            F: Fn(&str, &Task) -> Behaviour + Send + Sync + 'static,
        {
            Arc::new(ScriptedBackend {
                workers: workers.iter().map(|worker| worker.to_string()).collect(),
                script: Box::new(script),
                calls: Mutex::new(HashMap::new()),
            })
        }

        /// Backend whose `lost` worker loses every task.
        fn losing(workers: &[&str], lost: &'static str) -> Arc<Self> {
            Self::new(workers, move |worker, _| {
                if worker == lost {
                    Behaviour::Lose
                } else {
                    Behaviour::Run
                }
            })
        }

        fn calls(&self, worker: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .get(worker)
                .copied()
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl ClusterBackend for ScriptedBackend {
        async fn live_workers(&self) -> Vec<String> {
            self.workers.clone()
        }

        async fn execute(&self, worker: &str, task: Task) -> Result<PartialResult, ClusterError> {
            *self
                .calls
                .lock()
                .unwrap()
                .entry(worker.to_string())
                .or_default() += 1;
            match (self.script)(worker, &task) {
                Behaviour::Run => Ok(task.execute()?),
                Behaviour::Lose => Err(ClusterError::WorkerLost {
                    worker: worker.to_string(),
                }),
                Behaviour::Hang => std::future::pending().await,
            }
        }
    }

    async fn run_all(executor: &ClusterExecutor, tasks: Vec<Task>) -> Vec<TaskOutcome> {
        executor
            .submit(RunId::nil(), tasks)
            .await
            .unwrap()
            .collect()
            .await
    }

    fn total_count(outcomes: &[TaskOutcome]) -> i64 {
        outcomes
            .iter()
            .map(|outcome| {
                outcome.result.as_ref().unwrap().field::<i64>("count").unwrap().sum()
            })
            .sum()
    }

    #[test]
    fn cluster_error_conversion() {
        let error: EngineError = ClusterError::WorkerLost {
            worker: "w".to_string(),
        }
        .into();
        assert!(error.is_retryable());
        let error: EngineError = ClusterError::Transport("reset".to_string()).into();
        assert!(error.is_retryable());
        let error: EngineError =
            ClusterError::Task(EngineError::configuration("bad")).into();
        assert!(!error.is_retryable());
    }

    #[test]
    fn rotation_round_robin() {
        let rotation = Rotation::default();
        let workers = vec!["a".to_string(), "b".to_string()];
        assert_eq!(Some("a".to_string()), rotation.pick(&workers));
        assert_eq!(Some("b".to_string()), rotation.pick(&workers));
        assert_eq!(Some("a".to_string()), rotation.pick(&workers));
        assert_eq!(None, rotation.pick(&[]));
    }

    #[test]
    fn rotation_passes_over_lost_worker() {
        let rotation = Rotation::default();
        let workers = vec!["a".to_string(), "b".to_string()];
        rotation.lose("a");
        for _ in 0..3 {
            assert_eq!(Some("b".to_string()), rotation.pick(&workers));
        }
        // A lost worker is still picked when it is the only candidate.
        assert_eq!(Some("a".to_string()), rotation.pick(&workers[..1]));
        rotation.recover("a");
        let picks: Vec<_> = (0..2).filter_map(|_| rotation.pick(&workers)).collect();
        assert!(picks.contains(&"a".to_string()), "{:?}", picks);
    }

    #[test]
    fn rotation_quarantine_expires() {
        let rotation = Rotation {
            quarantine: Duration::ZERO,
            ..Rotation::default()
        };
        let workers = vec!["a".to_string(), "b".to_string()];
        rotation.lose("a");
        let picks: Vec<_> = (0..2).filter_map(|_| rotation.pick(&workers)).collect();
        assert!(picks.contains(&"a".to_string()), "{:?}", picks);
    }

    #[tokio::test]
    async fn resubmits_after_worker_loss() {
        let backend = ScriptedBackend::losing(&["a", "b", "c"], "b");
        let executor = ClusterExecutor::new(backend.clone(), 1, policy()).unwrap();
        let outcomes = run_all(&executor, test_utils::count_tasks(&[12], 6)).await;
        assert_eq!(6, outcomes.len());
        assert_eq!(12, total_count(&outcomes));
        // The lost worker is tried once and then passed over.
        assert_eq!(1, backend.calls("b"));
        assert_eq!(6, backend.calls("a") + backend.calls("c"));
    }

    #[tokio::test]
    async fn lost_worker_comes_back() {
        let lost_once = AtomicBool::new(false);
        let backend = ScriptedBackend::new(&["a"], move |_, _| {
            if lost_once.swap(true, Ordering::SeqCst) {
                Behaviour::Run
            } else {
                Behaviour::Lose
            }
        });
        let executor = ClusterExecutor::new(backend.clone(), 1, policy()).unwrap();
        let outcomes = run_all(&executor, test_utils::count_tasks(&[4], 1)).await;
        assert_eq!(1, outcomes[0].task.attempt);
        assert_eq!(4, total_count(&outcomes));
        // The worker serves the next run as well.
        let outcomes = run_all(&executor, test_utils::count_tasks(&[4], 2)).await;
        assert_eq!(4, total_count(&outcomes));
        assert_eq!(4, backend.calls("a"));
    }

    #[tokio::test]
    async fn hung_attempts_do_not_block_run() {
        let backend = ScriptedBackend::new(&["a"], |_, task| {
            if task.attempt == 0 {
                Behaviour::Hang
            } else {
                Behaviour::Run
            }
        });
        let policy = RetryPolicy {
            task_timeout: Some(Duration::from_millis(50)),
            ..policy()
        };
        let executor = ClusterExecutor::new(backend, 1, policy).unwrap();
        let stream = executor
            .submit(RunId::nil(), test_utils::count_tasks(&[6], 3))
            .await
            .unwrap();
        let outcomes: Vec<_> =
            tokio::time::timeout(Duration::from_secs(3), stream.take(3).collect())
                .await
                .unwrap();
        assert_eq!(6, total_count(&outcomes));
        assert!(outcomes.iter().all(|outcome| outcome.task.attempt == 1));
        executor.cancel(RunId::nil()).await;
    }

    #[tokio::test]
    async fn no_live_workers() {
        let backend = ScriptedBackend::losing(&[], "");
        let executor = ClusterExecutor::new(backend, 1, policy()).unwrap();
        let tasks = test_utils::count_tasks(&[4], 1);
        assert!(matches!(
            executor.submit(RunId::nil(), tasks).await.err(),
            Some(EngineError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn all_workers_lost() {
        let backend = ScriptedBackend::losing(&["a"], "a");
        let executor = ClusterExecutor::new(backend, 1, policy()).unwrap();
        let outcomes = run_all(&executor, test_utils::count_tasks(&[4], 1)).await;
        match &outcomes[0].result {
            Err(EngineError::TaskFailure {
                attempts, source, ..
            }) => {
                assert_eq!(3, *attempts);
                assert!(matches!(**source, EngineError::WorkerFailure { .. }));
            }
            result => panic!("unexpected result {:?}", result),
        }
    }

    #[tokio::test]
    async fn tasks_run_at_their_locations() {
        let backend = ScriptedBackend::losing(&["a", "b", "c"], "");
        let executor = ClusterExecutor::new(backend.clone(), 1, policy()).unwrap();
        let dataset = test_utils::PinnedDataset::new(&[8], &[1], Some(&["b"]));
        let outcomes = run_all(&executor, test_utils::tasks_for(dataset, 4)).await;
        assert_eq!(8, total_count(&outcomes));
        assert_eq!(4, backend.calls("b"));
        assert_eq!(0, backend.calls("a") + backend.calls("c"));
    }

    #[tokio::test]
    async fn locations_without_live_worker() {
        let backend = ScriptedBackend::losing(&["a"], "");
        let executor = ClusterExecutor::new(backend.clone(), 1, policy()).unwrap();
        let dataset = test_utils::PinnedDataset::new(&[4], &[1], Some(&["z"]));
        let outcomes = run_all(&executor, test_utils::tasks_for(dataset, 1)).await;
        match &outcomes[0].result {
            Err(EngineError::TaskFailure { source, .. }) => match source.as_ref() {
                EngineError::WorkerFailure { reason, .. } => {
                    assert_eq!(r#"no live worker among ["z"]"#, reason)
                }
                err => panic!("unexpected source {:?}", err),
            },
            result => panic!("unexpected result {:?}", result),
        }
        assert_eq!(0, backend.calls("a"));
    }

    #[tokio::test]
    async fn empty_locations_rejected() {
        let backend = ScriptedBackend::losing(&["a"], "");
        let executor = ClusterExecutor::new(backend, 1, policy()).unwrap();
        let dataset = test_utils::PinnedDataset::new(&[4], &[1], Some(&[]));
        match executor
            .submit(RunId::nil(), test_utils::tasks_for(dataset, 2))
            .await
            .err()
        {
            Some(EngineError::Configuration { reason }) => {
                assert_eq!("no workers found for task p0.a0", reason)
            }
            result => panic!("unexpected result {:?}", result),
        }
    }

    #[tokio::test]
    async fn local_cluster_stopped_worker() {
        let cluster = LocalCluster::new(2, 1).unwrap();
        assert!(cluster.stop_worker("worker-0"));
        assert!(!cluster.stop_worker("worker-9"));
        assert_eq!(vec!["worker-1".to_string()], cluster.live_workers().await);

        let task = test_utils::count_tasks(&[4], 1).remove(0);
        assert!(matches!(
            cluster.execute("worker-0", task.clone()).await,
            Err(ClusterError::WorkerLost { .. })
        ));
        assert!(matches!(
            cluster.execute("worker-7", task.clone()).await,
            Err(ClusterError::Transport(_))
        ));
        let partial = cluster.execute("worker-1", task).await.unwrap();
        assert_eq!(
            Some(&ndarray::array![4_i64].into_dyn()),
            partial.field::<i64>("count")
        );
    }

    #[tokio::test]
    async fn local_cluster_runs_all_tasks() {
        let cluster = Arc::new(LocalCluster::new(3, 1).unwrap());
        let executor = ClusterExecutor::new(cluster.clone(), 2, policy()).unwrap();
        let outcomes = run_all(&executor, test_utils::count_tasks(&[30], 10)).await;
        assert_eq!(10, outcomes.len());
        assert_eq!(30, total_count(&outcomes));
    }

    #[tokio::test]
    async fn close_shuts_down_local_cluster() {
        let cluster = Arc::new(LocalCluster::new(2, 1).unwrap());
        let executor = ClusterExecutor::new(cluster.clone(), 1, policy()).unwrap();
        executor.close().await;
        assert!(cluster.live_workers().await.is_empty());
        assert!(matches!(
            executor
                .submit(RunId::nil(), test_utils::count_tasks(&[4], 1))
                .await
                .err(),
            Some(EngineError::Configuration { .. })
        ));
    }
}
