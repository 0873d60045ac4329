//! Error handling.

use axum::{
    extract::rejection::JsonRejection,
    http::header,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use ndarray::ShapeError;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;
use tracing::{event, Level};
use uuid::Uuid;

use crate::task::TaskId;

/// Engine error type
///
/// This type encapsulates the various errors that may occur while partitioning a dataset,
/// executing tasks and merging their results, as well as errors at the HTTP boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid partitioning, UDF declaration or ROI inputs
    #[error("invalid configuration: {reason}")]
    Configuration { reason: String },

    /// Error converting from bytes to a type
    #[error("failed to convert from bytes to {type_name}")]
    FromBytes { type_name: &'static str },

    /// Insufficient memory to process a partition
    #[error("Insufficient memory to process partition ({requested} > {total})")]
    InsufficientMemory { requested: usize, total: usize },

    /// A partial result disagrees with the declared shape or dtype of a field
    #[error("field {field} of partition {partition} has shape {actual:?}, expected {expected:?}")]
    MergeShapeMismatch {
        field: String,
        partition: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Error reading a partition's frames from the dataset
    #[error("failed to read partition {partition}")]
    PartitionRead {
        partition: usize,
        #[source]
        source: std::io::Error,
    },

    /// Error deserialising request data into RunRequest
    #[error("request data is not valid")]
    RequestDataJsonRejection(#[from] JsonRejection),

    /// Error validating RunRequest (single error)
    #[error("request data is not valid")]
    RequestDataValidationSingle(#[from] validator::ValidationError),

    /// Error validating RunRequest (multiple errors)
    #[error("request data is not valid")]
    RequestDataValidation(#[from] validator::ValidationErrors),

    /// A run with the same identifier is already active
    #[error("run {run_id} is already in progress")]
    RunInProgress { run_id: Uuid },

    /// No active run with the requested identifier
    #[error("run {run_id} not found")]
    RunNotFound { run_id: Uuid },

    /// Error acquiring a semaphore
    #[error("error acquiring resources")]
    SemaphoreAcquireError(#[from] AcquireError),

    /// Error creating an ndarray array from a shape
    #[error("failed to create array from shape")]
    ShapeInvalid(#[from] ShapeError),

    /// A task exhausted its retry budget
    #[error("task {task} for partition {partition} failed after {attempts} attempts")]
    TaskFailure {
        task: TaskId,
        partition: usize,
        attempts: u32,
        #[source]
        source: Box<EngineError>,
    },

    /// A task attempt did not complete in time
    #[error("task attempt for partition {partition} timed out after {timeout:?}")]
    TaskTimeout { partition: usize, timeout: Duration },

    /// Error converting between integer types
    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),

    /// Unsupported UDF requested
    #[error("unsupported UDF {name}")]
    UnsupportedUdf { name: String },

    /// A worker crashed or was lost while running a task attempt
    #[error("worker {worker} failed: {reason}")]
    WorkerFailure { worker: String, reason: String },
}

impl EngineError {
    /// Whether a task attempt that failed with this error may be retried.
    ///
    /// Read errors, worker failures and timeouts are transient. Everything else is either a
    /// configuration problem or a defect and is fatal to the run.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::PartitionRead { .. }
                | EngineError::WorkerFailure { .. }
                | EngineError::TaskTimeout { .. }
        )
    }

    /// Shorthand for a configuration error.
    pub fn configuration(reason: impl Into<String>) -> Self {
        EngineError::Configuration {
            reason: reason.into(),
        }
    }
}

impl IntoResponse for EngineError {
    /// Convert from an `EngineError` into an [axum::response::Response].
    fn into_response(self) -> Response {
        ErrorResponse::from(self).into_response()
    }
}

/// Body of error response
///
/// Implements serde (de)serialise.
#[derive(Deserialize, Serialize)]
struct ErrorBody {
    /// Main error message
    message: String,

    /// Optional list of causes
    #[serde(skip_serializing_if = "Option::is_none")]
    caused_by: Option<Vec<String>>,
}

impl ErrorBody {
    /// Return a new ErrorBody
    ///
    /// # Arguments
    ///
    /// * `error`: The error that occurred
    fn new<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        let message = error.to_string();
        let mut caused_by: Option<Vec<String>> = None;
        let mut current = error.source();
        while let Some(source) = current {
            caused_by
                .get_or_insert_with(Vec::new)
                .push(source.to_string());
            current = source.source();
        }
        // Remove duplicate entries.
        if let Some(caused_by) = caused_by.as_mut() {
            caused_by.dedup()
        }
        ErrorBody { message, caused_by }
    }
}

/// A response to send in error cases
#[derive(Deserialize, Serialize)]
struct ErrorResponse {
    /// HTTP status of the response
    #[serde(skip)]
    status: StatusCode,

    /// Response body
    error: ErrorBody,
}

impl ErrorResponse {
    fn new<E>(status: StatusCode, error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        ErrorResponse {
            status,
            error: ErrorBody::new(error),
        }
    }
}

impl From<EngineError> for ErrorResponse {
    /// Convert from an `EngineError` into an `ErrorResponse`.
    fn from(error: EngineError) -> Self {
        let status = match &error {
            EngineError::Configuration { .. }
            | EngineError::InsufficientMemory { .. }
            | EngineError::RequestDataJsonRejection(_)
            | EngineError::RequestDataValidationSingle(_)
            | EngineError::RequestDataValidation(_)
            | EngineError::ShapeInvalid(_) => StatusCode::BAD_REQUEST,

            EngineError::RunNotFound { .. } | EngineError::UnsupportedUdf { .. } => {
                StatusCode::NOT_FOUND
            }

            EngineError::RunInProgress { .. } => StatusCode::CONFLICT,

            EngineError::FromBytes { .. }
            | EngineError::MergeShapeMismatch { .. }
            | EngineError::PartitionRead { .. }
            | EngineError::SemaphoreAcquireError(_)
            | EngineError::TaskFailure { .. }
            | EngineError::TaskTimeout { .. }
            | EngineError::TryFromInt(_)
            | EngineError::WorkerFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let response = Self::new(status, &error);

        // Log server errors.
        if response.status.is_server_error() {
            event!(Level::ERROR, "{}", error.to_string());
            let mut current = error.source();
            while let Some(source) = current {
                event!(Level::ERROR, "Caused by: {}", source.to_string());
                current = source.source();
            }
        }

        response
    }
}

impl IntoResponse for ErrorResponse {
    /// Convert from an `ErrorResponse` into an `axum::response::Response`.
    ///
    /// Renders the response as JSON.
    fn into_response(self) -> Response {
        let json_body = serde_json::to_string_pretty(&self);
        match json_body {
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to serialise error response: {}", err),
            )
                .into_response(),
            Ok(json_body) => (
                self.status,
                [(&header::CONTENT_TYPE, mime::APPLICATION_JSON.to_string())],
                json_body,
            )
                .into_response(),
        }
    }
}
