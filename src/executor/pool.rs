//! Executor running tasks on a local thread pool.

use super::{panic_message, Executor, RetryPolicy, RunRegistry, TaskStream};
use crate::buffers::PartialResult;
use crate::error::EngineError;
use crate::resource_manager::ResourceManager;
use crate::task::{RunId, Task};

use async_trait::async_trait;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio_rayon::AsyncThreadPool;

/// Executes tasks on a fixed-size [rayon] thread pool.
///
/// At most `pool_size` tasks are in flight, and the result channel of a run holds at most
/// `pool_size` undelivered partial results.
#[derive(Debug)]
pub struct LocalPoolExecutor {
    pool: Arc<rayon::ThreadPool>,
    resources: Arc<ResourceManager>,
    registry: RunRegistry,
}

impl LocalPoolExecutor {
    /// Return a new LocalPoolExecutor.
    ///
    /// # Arguments
    ///
    /// * `pool_size`: Number of worker threads
    /// * `memory_limit`: Optional limit on the bytes of partition data processed at once
    /// * `policy`: Retry policy
    pub fn new(
        pool_size: usize,
        memory_limit: Option<usize>,
        policy: RetryPolicy,
    ) -> Result<Self, EngineError> {
        if pool_size == 0 {
            return Err(EngineError::configuration("pool size must be positive"));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(pool_size)
            .thread_name(|index| format!("stackmerge-pool-{}", index))
            .build()
            .map_err(|err| EngineError::configuration(format!("cannot build pool: {}", err)))?;
        Ok(LocalPoolExecutor {
            pool: Arc::new(pool),
            resources: Arc::new(ResourceManager::new(memory_limit, Some(pool_size))),
            registry: RunRegistry::new(policy),
        })
    }

    /// Number of worker threads.
    pub fn pool_size(&self) -> usize {
        self.pool.current_num_threads()
    }
}

/// Execute one attempt on the pool, turning a panic into a worker failure.
async fn attempt(pool: Arc<rayon::ThreadPool>, task: Task) -> Result<PartialResult, EngineError> {
    pool.spawn_async(move || {
        catch_unwind(AssertUnwindSafe(|| task.execute())).unwrap_or_else(|panic| {
            Err(EngineError::WorkerFailure {
                worker: format!("pool-{}", rayon::current_thread_index().unwrap_or_default()),
                reason: panic_message(panic.as_ref()),
            })
        })
    })
    .await
}

#[async_trait]
impl Executor for LocalPoolExecutor {
    async fn submit(&self, run_id: RunId, tasks: Vec<Task>) -> Result<TaskStream, EngineError> {
        let pool = self.pool.clone();
        let stream = self
            .registry
            .start(
                run_id,
                tasks,
                self.resources.clone(),
                self.pool_size(),
                move |task| attempt(pool.clone(), task),
            )
            .await;
        Ok(stream)
    }

    async fn cancel(&self, run_id: RunId) {
        self.registry.cancel(run_id).await
    }

    async fn close(&self) {
        self.registry.cancel_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::buffers::{BufferDType, BufferDecl};
    use crate::dataset::Dataset;
    use crate::partition::Partition;
    use crate::roi::RoiSlice;
    use crate::test_utils;
    use crate::udf::{FramePosition, Udf, UdfMeta};
    use ndarray::ArrayViewD;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_millis(1),
            task_timeout: None,
        }
    }

    #[derive(Debug)]
    struct Panicking {}

    impl Udf for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn result_buffers(&self, _meta: &UdfMeta) -> Vec<BufferDecl> {
            vec![BufferDecl::sum("count", BufferDType::Int64, &[1])]
        }

        fn process_frame(
            &self,
            _frame: ArrayViewD<f32>,
            _position: FramePosition,
            _buffers: &mut PartialResult,
        ) -> Result<(), EngineError> {
            panic!("frame exploded")
        }
    }

    #[test]
    fn zero_pool_size() {
        assert!(matches!(
            LocalPoolExecutor::new(0, None, policy()).unwrap_err(),
            EngineError::Configuration { .. }
        ));
    }

    #[tokio::test]
    async fn runs_all_tasks() {
        let executor = LocalPoolExecutor::new(2, None, policy()).unwrap();
        assert_eq!(2, executor.pool_size());
        let tasks = test_utils::count_tasks(&[20], 5);
        let outcomes: Vec<_> = executor
            .submit(RunId::nil(), tasks)
            .await
            .unwrap()
            .collect()
            .await;
        let mut partitions: Vec<_> = outcomes
            .iter()
            .map(|outcome| outcome.task.partition)
            .collect();
        partitions.sort();
        assert_eq!(vec![0, 1, 2, 3, 4], partitions);
        assert!(outcomes.iter().all(|outcome| outcome.result.is_ok()));
        executor.cancel(RunId::nil()).await;
    }

    #[tokio::test]
    async fn retries_flaky_partition() {
        let executor = LocalPoolExecutor::new(2, None, policy()).unwrap();
        let dataset = test_utils::FlakyDataset::new(&[10], &[2], 4, 2);
        let tasks = test_utils::tasks_for(dataset.clone(), 5);
        let outcomes: Vec<_> = executor
            .submit(RunId::nil(), tasks)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(5, outcomes.len());
        assert_eq!(3, dataset.reads_of(4));
        let flaky = outcomes
            .iter()
            .find(|outcome| outcome.task.partition == 2)
            .unwrap();
        assert_eq!(2, flaky.task.attempt);
        assert!(outcomes.iter().all(|outcome| outcome.result.is_ok()));
    }

    #[tokio::test]
    async fn panic_becomes_task_failure() {
        let executor = LocalPoolExecutor::new(1, None, policy()).unwrap();
        let dataset: Arc<dyn Dataset> = test_utils::memory_dataset(&[4], &[2]);
        let udf: Arc<dyn Udf> = Arc::new(Panicking {});
        let decls = Arc::new(vec![BufferDecl::sum("count", BufferDType::Int64, &[1])]);
        let task = Task::new(
            RunId::nil(),
            Partition::new(0, 0..4, dataset),
            udf,
            decls,
            RoiSlice::all(0..4),
        );
        let outcomes: Vec<_> = executor
            .submit(RunId::nil(), vec![task])
            .await
            .unwrap()
            .collect()
            .await;
        match &outcomes[0].result {
            Err(EngineError::TaskFailure {
                attempts, source, ..
            }) => {
                assert_eq!(4, *attempts);
                match source.as_ref() {
                    EngineError::WorkerFailure { worker, reason } => {
                        assert_eq!("pool-0", worker);
                        assert_eq!("frame exploded", reason);
                    }
                    err => panic!("unexpected source {:?}", err),
                }
            }
            result => panic!("unexpected result {:?}", result),
        }
    }
}
