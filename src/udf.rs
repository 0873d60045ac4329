//! User-defined functions (UDFs).

use crate::buffers::{BufferDecl, PartialResult};
use crate::dataset::{DatasetShape, PartitionData};
use crate::error::EngineError;
use crate::models::DType;
use crate::roi::RoiSlice;

use ndarray::ArrayViewD;

/// Metadata of the dataset a UDF runs over.
#[derive(Clone, Debug, PartialEq)]
pub struct UdfMeta {
    /// Shape of the dataset
    pub shape: DatasetShape,
    /// Data type of the stored samples
    pub dtype: DType,
}

/// Position of a frame within the dataset and within its partition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FramePosition {
    /// Linear navigation index within the dataset
    pub global: usize,
    /// Index within the partition
    pub local: usize,
}

/// Trait for UDFs.
///
/// This forms the contract between the engine and analysis routines. A UDF is a stateless
/// descriptor: per-task state lives in the [PartialResult] it writes to, which the engine
/// allocates from the declaration returned by `result_buffers`.
pub trait Udf: Send + Sync + std::fmt::Debug {
    /// Name of the UDF.
    fn name(&self) -> &str;

    /// Declare the result buffers.
    ///
    /// The declaration is captured once at the start of a run.
    fn result_buffers(&self, meta: &UdfMeta) -> Vec<BufferDecl>;

    /// Process one frame.
    ///
    /// # Arguments
    ///
    /// * `frame`: Frame data with the dataset's signal shape
    /// * `position`: Position of the frame
    /// * `buffers`: Partial result of the partition
    fn process_frame(
        &self,
        frame: ArrayViewD<f32>,
        position: FramePosition,
        buffers: &mut PartialResult,
    ) -> Result<(), EngineError>;

    /// Process the frames of a partition.
    ///
    /// The default implementation calls `process_frame` for every position selected by the ROI.
    ///
    /// # Arguments
    ///
    /// * `data`: Frames of the partition, shaped `(len, signal...)`
    /// * `roi`: ROI restricted to the partition
    /// * `buffers`: Partial result of the partition
    fn process_partition(
        &self,
        data: &PartitionData,
        roi: &RoiSlice,
        buffers: &mut PartialResult,
    ) -> Result<(), EngineError> {
        for (local, frame) in data.outer_iter().enumerate() {
            if !roi.is_selected(local) {
                continue;
            }
            let position = FramePosition {
                global: roi.start() + local,
                local,
            };
            self.process_frame(frame, position, buffers)?;
        }
        Ok(())
    }
}
