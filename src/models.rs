//! Data types and associated functions and methods

use crate::buffers::ResultSet;
use crate::runner::RunOutcome;
use crate::types::ByteOrder;

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Supported numerical data types of raw detector data
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// [u8]
    Uint8,
    /// [u16]
    Uint16,
    /// [u32]
    Uint32,
    /// [u64]
    Uint64,
    /// [i32]
    Int32,
    /// [i64]
    Int64,
    /// [f32]
    Float32,
    /// [f64]
    Float64,
}

impl DType {
    /// Returns the size of the associated type in bytes.
    pub fn size_of(self) -> usize {
        match self {
            Self::Uint8 => std::mem::size_of::<u8>(),
            Self::Uint16 => std::mem::size_of::<u16>(),
            Self::Uint32 => std::mem::size_of::<u32>(),
            Self::Uint64 => std::mem::size_of::<u64>(),
            Self::Int32 => std::mem::size_of::<i32>(),
            Self::Int64 => std::mem::size_of::<i64>(),
            Self::Float32 => std::mem::size_of::<f32>(),
            Self::Float64 => std::mem::size_of::<f64>(),
        }
    }
}

/// Description of a raw binary frame stack on the server's file system.
///
/// Frames are stored contiguously in row-major order, navigation axes first.
#[derive(Clone, Debug, Deserialize, PartialEq, Validate)]
#[serde(deny_unknown_fields)]
pub struct RawDatasetSpec {
    /// Path of the raw file
    #[validate(length(min = 1, message = "path must not be empty"))]
    pub path: String,
    /// Data type of each sample
    pub dtype: DType,
    /// Byte order of each sample, defaults to little endian
    pub byte_order: Option<ByteOrder>,
    /// Offset in bytes of the first frame within the file
    pub offset: Option<u64>,
    /// Shape of the navigation (scan) axes
    #[validate(
        length(min = 1, message = "nav_shape length must be greater than 0"),
        custom = "validate_shape"
    )]
    pub nav_shape: Vec<usize>,
    /// Shape of each frame
    #[validate(
        length(min = 1, message = "sig_shape length must be greater than 0"),
        custom = "validate_shape"
    )]
    pub sig_shape: Vec<usize>,
}

/// Request data for a UDF run
#[derive(Debug, Deserialize, PartialEq, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_run_request"))]
pub struct RunRequest {
    /// Optional caller-chosen run identifier, used to cancel the run
    pub run_id: Option<Uuid>,
    /// Dataset to run over
    #[validate]
    pub dataset: RawDatasetSpec,
    /// Optional region of interest, one flag per navigation position in row-major order
    pub roi: Option<Vec<bool>>,
    /// Optional number of partitions
    #[validate(range(min = 1, message = "partitions must be greater than 0"))]
    pub partitions: Option<usize>,
}

/// Validate an array shape
fn validate_shape(shape: &[usize]) -> Result<(), ValidationError> {
    if shape.iter().any(|index| *index == 0) {
        return Err(ValidationError::new("shape indices must be greater than 0"));
    }
    if shape_size(shape).is_none() {
        return Err(ValidationError::new("shape size must fit in a usize"));
    }
    Ok(())
}

/// Number of elements of an array shape, or `None` on overflow.
fn shape_size(shape: &[usize]) -> Option<usize> {
    shape
        .iter()
        .try_fold(1_usize, |size, index| size.checked_mul(*index))
}

/// Validate that a ROI is consistent with the navigation shape
fn validate_run_request(request: &RunRequest) -> Result<(), ValidationError> {
    // An overflowing nav_shape is reported by its field validation.
    if let (Some(roi), Some(nav_size)) = (&request.roi, shape_size(&request.dataset.nav_shape)) {
        if roi.len() != nav_size {
            let mut error =
                ValidationError::new("ROI length must be equal to the product of nav_shape");
            error.add_param("roi".into(), &roi.len());
            error.add_param("nav size".into(), &nav_size);
            return Err(error);
        }
    }
    Ok(())
}

/// Terminal state of a run as reported to clients
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Every partition was merged
    Completed,
    /// The run was cancelled; results hold the partitions merged so far
    Cancelled,
}

/// Response containing the aggregate of a run.
#[derive(Debug, Serialize)]
pub struct RunResponse {
    /// Identifier of the run
    pub run_id: Uuid,
    /// Whether the run completed or was cancelled
    pub outcome: Outcome,
    /// Aggregate result buffers
    pub results: ResultSet,
}

impl RunResponse {
    /// Return a RunResponse for a finished run.
    pub fn new(run_id: Uuid, outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Completed(results) => RunResponse {
                run_id,
                outcome: Outcome::Completed,
                results,
            },
            RunOutcome::Cancelled(results) => RunResponse {
                run_id,
                outcome: Outcome::Cancelled,
                results,
            },
        }
    }
}
