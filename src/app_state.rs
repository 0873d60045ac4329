use crate::cancel::CancelToken;
use crate::cli::{CommandLineArgs, ExecutorKind};
use crate::error::EngineError;
use crate::executor::cluster::{ClusterExecutor, LocalCluster};
use crate::executor::inline::InlineExecutor;
use crate::executor::pool::LocalPoolExecutor;
use crate::executor::Executor;
use crate::partition::PartitionHint;
use crate::runner::{Runner, RunnerConfig};
use crate::task::RunId;

use hashbrown::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared application state passed to each request handler.
pub struct AppState {
    /// Command line arguments.
    pub args: CommandLineArgs,

    /// Runner driving every run on the configured executor.
    pub runner: Runner,

    /// Cancel tokens of the runs in progress.
    pub runs: RwLock<HashMap<RunId, CancelToken>>,
}

impl AppState {
    /// Create and return an [AppState].
    pub fn new(args: &CommandLineArgs) -> Result<Self, EngineError> {
        let policy = args.retry_policy();
        let executor: Arc<dyn Executor> = match args.executor {
            ExecutorKind::Inline => Arc::new(InlineExecutor::new(policy)),
            ExecutorKind::Pool => Arc::new(LocalPoolExecutor::new(
                args.workers(),
                args.memory_limit,
                policy,
            )?),
            ExecutorKind::Cluster => {
                let cluster = LocalCluster::new(args.workers(), args.threads_per_worker)?;
                let tasks_per_worker = args.tasks_per_worker.unwrap_or(args.threads_per_worker);
                Arc::new(ClusterExecutor::new(
                    Arc::new(cluster),
                    tasks_per_worker,
                    policy,
                )?)
            }
        };
        tracing::info!(executor = ?args.executor, workers = args.workers(), "executor ready");
        let config = RunnerConfig {
            partition_hint: PartitionHint::MaxBytes(args.partition_size),
        };

        Ok(Self {
            args: args.clone(),
            runner: Runner::new(executor, config),
            runs: RwLock::new(HashMap::new()),
        })
    }

    /// Register a run so that it can be cancelled by identifier.
    pub async fn register_run(&self, run_id: RunId) -> Result<CancelToken, EngineError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run_id) {
            return Err(EngineError::RunInProgress { run_id });
        }
        let token = CancelToken::new();
        runs.insert(run_id, token.clone());
        Ok(token)
    }

    /// Forget a finished run.
    pub async fn finish_run(&self, run_id: RunId) {
        self.runs.write().await.remove(&run_id);
    }

    /// Raise the cancel token of a run in progress.
    pub async fn cancel_run(&self, run_id: RunId) -> Result<(), EngineError> {
        match self.runs.read().await.get(&run_id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(EngineError::RunNotFound { run_id }),
        }
    }
}

/// AppState wrapped in an Atomic Reference Count (Arc) to allow multiple references.
pub type SharedAppState = Arc<AppState>;
