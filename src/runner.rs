//! Runner: partitions a dataset, submits one task per partition and merges the results.

use crate::buffers::{validate_decls, BufferDecl, PartialResult, ResultSet};
use crate::cancel::CancelToken;
use crate::dataset::Dataset;
use crate::error::EngineError;
use crate::executor::Executor;
use crate::merge::merge_partial;
use crate::metrics;
use crate::partition::{self, PartitionHint};
use crate::roi::{Roi, RoiSlice};
use crate::task::{RunId, Task, TaskId};
use crate::udf::{Udf, UdfMeta};

use std::ops::Range;
use std::sync::Arc;
use tokio_stream::StreamExt;

/// Runner configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RunnerConfig {
    /// How to size partitions
    pub partition_hint: PartitionHint,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            partition_hint: PartitionHint::Auto {
                workers: num_cpus::get(),
            },
        }
    }
}

/// Terminal state of a run.
#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    /// Every partition was merged exactly once.
    Completed(ResultSet),
    /// The run was cancelled. Holds the partitions merged before cancellation.
    Cancelled(ResultSet),
}

impl RunOutcome {
    /// The aggregate, complete or not.
    pub fn results(&self) -> &ResultSet {
        match self {
            RunOutcome::Completed(results) | RunOutcome::Cancelled(results) => results,
        }
    }

    /// Whether the run was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunOutcome::Cancelled(_))
    }
}

/// Drives runs on an [Executor].
///
/// The runner is the only writer of the aggregate. It accepts exactly one partial result per
/// partition and discards any later duplicate.
#[derive(Clone, Debug)]
pub struct Runner {
    executor: Arc<dyn Executor>,
    config: RunnerConfig,
}

/// Bookkeeping of the partitions of a run.
struct Ledger {
    decls: Arc<Vec<BufferDecl>>,
    ranges: Vec<Range<usize>>,
    accepted: Vec<bool>,
    remaining: usize,
}

impl Ledger {
    fn new(decls: Arc<Vec<BufferDecl>>, ranges: Vec<Range<usize>>) -> Self {
        let remaining = ranges.len();
        Ledger {
            decls,
            accepted: vec![false; remaining],
            ranges,
            remaining,
        }
    }

    /// Merge a partial result unless its partition was already accepted.
    fn accept(
        &mut self,
        task: TaskId,
        partial: &PartialResult,
        results: &mut ResultSet,
    ) -> Result<(), EngineError> {
        let partition = task.partition;
        let (Some(range), Some(false)) = (
            self.ranges.get(partition),
            self.accepted.get(partition).copied(),
        ) else {
            tracing::debug!(%task, "discarding stale result");
            metrics::STALE_RESULTS_DISCARDED.inc();
            return Ok(());
        };
        if partial.partition != partition {
            return Err(EngineError::MergeShapeMismatch {
                field: "partition".to_string(),
                partition,
                expected: vec![partition],
                actual: vec![partial.partition],
            });
        }
        let timer = metrics::MERGE_TIME.start_timer();
        merge_partial(&self.decls, partial, range, results)?;
        timer.observe_duration();
        self.accepted[partition] = true;
        self.remaining -= 1;
        Ok(())
    }

    fn first_unaccepted(&self) -> Option<usize> {
        self.accepted.iter().position(|accepted| !accepted)
    }
}

impl Runner {
    /// Return a new Runner.
    pub fn new(executor: Arc<dyn Executor>, config: RunnerConfig) -> Self {
        Runner { executor, config }
    }

    /// Return a copy of this runner using a different partition hint.
    pub fn with_hint(&self, partition_hint: PartitionHint) -> Self {
        Runner {
            executor: self.executor.clone(),
            config: RunnerConfig { partition_hint },
        }
    }

    /// Stop every run and release the executor's workers.
    pub async fn close(&self) {
        self.executor.close().await
    }

    /// Run a UDF over a dataset under a fresh run identifier.
    pub async fn run(
        &self,
        dataset: Arc<dyn Dataset>,
        udf: Arc<dyn Udf>,
        roi: Option<&Roi>,
        cancel: &CancelToken,
    ) -> Result<RunOutcome, EngineError> {
        self.run_with_id(RunId::new_v4(), dataset, udf, roi, cancel)
            .await
    }

    /// Run a UDF over a dataset.
    ///
    /// Returns [RunOutcome::Completed] once every partition has been merged, or
    /// [RunOutcome::Cancelled] with the partial aggregate if `cancel` is raised first. A fatal
    /// task error or merge error ends the run with that error.
    ///
    /// # Arguments
    ///
    /// * `run_id`: Identifier of the run, used to cancel it on the executor
    /// * `dataset`: Dataset to process
    /// * `udf`: UDF to apply
    /// * `roi`: Optional mask over the navigation positions
    /// * `cancel`: Cancellation signal
    #[tracing::instrument(level = "INFO", skip_all, fields(%run_id, udf = udf.name()))]
    pub async fn run_with_id(
        &self,
        run_id: RunId,
        dataset: Arc<dyn Dataset>,
        udf: Arc<dyn Udf>,
        roi: Option<&Roi>,
        cancel: &CancelToken,
    ) -> Result<RunOutcome, EngineError> {
        let meta = UdfMeta {
            shape: dataset.shape().clone(),
            dtype: dataset.dtype(),
        };
        let decls = Arc::new(udf.result_buffers(&meta));
        validate_decls(&decls)?;
        if let Some(roi) = roi {
            roi.validate(&meta.shape)?;
        }
        let partitions = partition::partition(&dataset, self.config.partition_hint)?;

        let mut results = ResultSet::new(&decls, meta.shape.nav_size());
        let mut ledger = Ledger::new(
            decls.clone(),
            partitions
                .iter()
                .map(|partition| partition.range.clone())
                .collect(),
        );
        let mut tasks = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let slice = match roi {
                Some(roi) => roi.slice(partition.range.clone()),
                None => RoiSlice::all(partition.range.clone()),
            };
            if slice.is_empty() {
                // Nothing to process, but per-partition fields still get an entry.
                let partial = PartialResult::zeros(partition.id, &decls, partition.len());
                ledger.accept(TaskId::new(partition.id, 0), &partial, &mut results)?;
                continue;
            }
            tasks.push(Task::new(run_id, partition, udf.clone(), decls.clone(), slice));
        }
        tracing::info!(
            tasks = tasks.len(),
            skipped = ledger.ranges.len() - tasks.len(),
            "starting run"
        );
        if tasks.is_empty() {
            return Ok(RunOutcome::Completed(results));
        }

        metrics::TASKS_SUBMITTED.inc_by(tasks.len() as u64);
        let outcome = self
            .collect(run_id, tasks, &mut ledger, &mut results, cancel)
            .await;
        self.executor.cancel(run_id).await;
        match outcome {
            Ok(true) => {
                tracing::info!("run cancelled");
                Ok(RunOutcome::Cancelled(results))
            }
            Ok(false) => {
                tracing::info!("run completed");
                Ok(RunOutcome::Completed(results))
            }
            Err(error) => {
                tracing::error!(%error, "run failed");
                Err(error)
            }
        }
    }

    /// Submit tasks and merge their outcomes until every partition is accepted.
    ///
    /// Returns whether the run was cancelled.
    async fn collect(
        &self,
        run_id: RunId,
        tasks: Vec<Task>,
        ledger: &mut Ledger,
        results: &mut ResultSet,
        cancel: &CancelToken,
    ) -> Result<bool, EngineError> {
        let mut stream = self.executor.submit(run_id, tasks).await?;
        while ledger.remaining > 0 {
            if cancel.is_cancelled() {
                return Ok(true);
            }
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(true),
                outcome = stream.next() => outcome,
            };
            let Some(outcome) = outcome else {
                let partition = ledger.first_unaccepted().unwrap_or_default();
                return Err(EngineError::TaskFailure {
                    task: TaskId::new(partition, 0),
                    partition,
                    attempts: 0,
                    source: Box::new(EngineError::WorkerFailure {
                        worker: "executor".to_string(),
                        reason: "result stream ended before partition was merged".to_string(),
                    }),
                });
            };
            if ledger.accepted.get(outcome.task.partition) == Some(&true) {
                tracing::debug!(task = %outcome.task, "discarding stale outcome");
                metrics::STALE_RESULTS_DISCARDED.inc();
                continue;
            }
            let partial = outcome.result?;
            ledger.accept(outcome.task, &partial, results)?;
        }
        Ok(false)
    }
}
