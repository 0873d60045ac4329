//! This crate provides Stackmerge, a server that runs user-defined functions (UDFs) over stacks
//! of detector frames. A dataset is split along its navigation axes into partitions, each
//! partition is processed as an independent task on an executor, and the partial results are
//! merged into one aggregate result set as they arrive.
//!
//! Tasks may run inline, on a local thread pool, or on an in-process cluster of named workers.
//! Transient task failures are retried, lost workers are routed around, and runs may be
//! cancelled at any time, yielding the aggregate of the partitions merged so far.
//!
//! Stackmerge is built on top of a number of open source components.
//!
//! * [Tokio](tokio), the most popular asynchronous Rust runtime.
//! * [Axum](axum) web framework, built by the Tokio team, on top of the [hyper] HTTP library.
//! * [Rayon](rayon) thread pools run the CPU-bound partition work.
//! * [Serde](serde) performs (de)serialisation of JSON request and response data.
//! * [ndarray] provides [NumPy](https://numpy.org)-like n-dimensional arrays used for frames and
//!   result buffers.

pub mod app;
pub mod app_state;
pub mod array;
pub mod buffers;
pub mod cancel;
pub mod cli;
pub mod dataset;
pub mod error;
pub mod executor;
pub mod merge;
pub mod metrics;
pub mod models;
pub mod partition;
pub mod resource_manager;
pub mod roi;
pub mod runner;
pub mod server;
pub mod task;
#[cfg(test)]
pub mod test_utils;
pub mod tracing;
pub mod types;
pub mod udf;
pub mod udfs;
pub mod validated_json;
