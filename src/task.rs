//! Tasks: the unit of dispatch.

use crate::buffers::{BufferDecl, PartialResult};
use crate::error::EngineError;
use crate::partition::Partition;
use crate::roi::RoiSlice;
use crate::udf::Udf;

use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Identifier of a run.
pub type RunId = Uuid;

/// Identifier of one execution attempt of a partition.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TaskId {
    /// Partition id
    pub partition: usize,
    /// Attempt number, starting at zero
    pub attempt: u32,
}

impl TaskId {
    /// Return a new TaskId.
    pub fn new(partition: usize, attempt: u32) -> Self {
        TaskId { partition, attempt }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}.a{}", self.partition, self.attempt)
    }
}

/// One partition bound to one UDF and the partition's ROI slice.
///
/// A retry is a new Task for the same partition with the attempt number incremented.
#[derive(Clone, Debug)]
pub struct Task {
    /// Run the task belongs to
    pub run_id: RunId,
    /// Partition to process
    pub partition: Partition,
    /// Attempt number
    pub attempt: u32,
    udf: Arc<dyn Udf>,
    decls: Arc<Vec<BufferDecl>>,
    roi: RoiSlice,
}

impl Task {
    /// Return the first attempt of a task.
    ///
    /// # Arguments
    ///
    /// * `run_id`: Run the task belongs to
    /// * `partition`: Partition to process
    /// * `udf`: UDF to apply
    /// * `decls`: Result buffer declaration captured at run start
    /// * `roi`: ROI restricted to the partition
    pub fn new(
        run_id: RunId,
        partition: Partition,
        udf: Arc<dyn Udf>,
        decls: Arc<Vec<BufferDecl>>,
        roi: RoiSlice,
    ) -> Self {
        Task {
            run_id,
            partition,
            attempt: 0,
            udf,
            decls,
            roi,
        }
    }

    /// Identifier of this attempt.
    pub fn id(&self) -> TaskId {
        TaskId::new(self.partition.id, self.attempt)
    }

    /// Return the next attempt of this task.
    pub fn retry(&self) -> Task {
        Task {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    /// ROI restricted to the partition.
    pub fn roi(&self) -> &RoiSlice {
        &self.roi
    }

    /// Result buffer declaration.
    pub fn decls(&self) -> &[BufferDecl] {
        &self.decls
    }

    /// Size in bytes of the partition's decoded frames.
    pub fn bytes(&self) -> usize {
        self.partition.bytes()
    }

    /// Execute the attempt: read the partition and apply the UDF.
    ///
    /// This is CPU and I/O bound and should not run on an async executor thread.
    #[tracing::instrument(
        level = "DEBUG",
        skip(self),
        fields(task = %self.id(), udf = self.udf.name())
    )]
    pub fn execute(&self) -> Result<PartialResult, EngineError> {
        let data = self.partition.read()?;
        let mut partial =
            PartialResult::zeros(self.partition.id, &self.decls, self.partition.len());
        self.udf.process_partition(&data, &self.roi, &mut partial)?;
        Ok(partial)
    }
}

/// Result of one task attempt as streamed back by an executor.
#[derive(Debug)]
pub struct TaskOutcome {
    /// The attempt that produced the result
    pub task: TaskId,
    /// Partial result, or the error that ended the task
    pub result: Result<PartialResult, EngineError>,
}

impl TaskOutcome {
    /// Return a new TaskOutcome.
    pub fn new(task: TaskId, result: Result<PartialResult, EngineError>) -> Self {
        TaskOutcome { task, result }
    }
}
