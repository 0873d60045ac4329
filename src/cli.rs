//! Command Line Interface (CLI) arguments.

use crate::executor::RetryPolicy;

use byte_unit::Byte;
use clap::{Parser, ValueEnum};
use std::time::Duration;

/// Kind of executor that runs tasks.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ExecutorKind {
    /// Run tasks one after another on the request's task
    Inline,
    /// Run tasks on a local thread pool
    Pool,
    /// Run tasks on an in-process cluster of named workers
    Cluster,
}

/// Stackmerge command line interface
#[derive(Clone, Debug, Parser)]
pub struct CommandLineArgs {
    /// The IP address on which the server should listen
    #[arg(long, default_value = "0.0.0.0", env = "STACKMERGE_HOST")]
    pub host: String,
    /// The port to which the server should bind
    #[arg(long, default_value_t = 8080, env = "STACKMERGE_PORT")]
    pub port: u16,
    /// Maximum time in seconds to wait for runs to complete upon receiving `ctrl+c` signal.
    #[arg(long, default_value_t = 60, env = "STACKMERGE_SHUTDOWN_TIMEOUT")]
    pub graceful_shutdown_timeout: u64,
    /// Whether to enable sending traces to Jaeger.
    #[arg(long, default_value_t = false, env = "STACKMERGE_ENABLE_JAEGER")]
    pub enable_jaeger: bool,
    /// Executor that runs tasks.
    #[arg(long, value_enum, default_value_t = ExecutorKind::Pool, env = "STACKMERGE_EXECUTOR")]
    pub executor: ExecutorKind,
    /// Number of pool threads, or of cluster workers. Defaults to the number of CPUs.
    #[arg(long, env = "STACKMERGE_WORKERS")]
    pub workers: Option<usize>,
    /// Number of threads of each cluster worker.
    #[arg(long, default_value_t = 1, env = "STACKMERGE_THREADS_PER_WORKER")]
    pub threads_per_worker: usize,
    /// Number of tasks in flight per cluster worker. Defaults to the threads per worker.
    #[arg(long, env = "STACKMERGE_TASKS_PER_WORKER")]
    pub tasks_per_worker: Option<usize>,
    /// Optional limit on the partition data processed at once by the pool, e.g. "4GiB".
    #[arg(long, value_parser = parse_byte_size, env = "STACKMERGE_MEMORY_LIMIT")]
    pub memory_limit: Option<usize>,
    /// Number of retries of a task after a transient failure.
    #[arg(long, default_value_t = 3, env = "STACKMERGE_MAX_RETRIES")]
    pub max_retries: u32,
    /// Delay in milliseconds before retrying a task. Defaults to 100 (500 for the cluster).
    #[arg(long, env = "STACKMERGE_RETRY_BACKOFF_MS")]
    pub retry_backoff_ms: Option<u64>,
    /// Limit in seconds on one task attempt. Defaults to none (600 for the cluster).
    #[arg(long, env = "STACKMERGE_TASK_TIMEOUT_SECS")]
    pub task_timeout_secs: Option<u64>,
    /// Maximum size of the decoded data of one partition, e.g. "512MiB".
    #[arg(
        long,
        default_value = "512MiB",
        value_parser = parse_byte_size,
        env = "STACKMERGE_PARTITION_SIZE"
    )]
    pub partition_size: usize,
}

impl CommandLineArgs {
    /// Number of pool threads or cluster workers.
    pub fn workers(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get)
    }

    /// Retry policy of the configured executor.
    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = match self.executor {
            ExecutorKind::Cluster => RetryPolicy::remote(),
            ExecutorKind::Inline | ExecutorKind::Pool => RetryPolicy::local(),
        };
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: self
                .retry_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff),
            task_timeout: self
                .task_timeout_secs
                .map(Duration::from_secs)
                .or(defaults.task_timeout),
        }
    }
}

/// Parse a human-readable byte size such as "512MiB".
fn parse_byte_size(size: &str) -> Result<usize, String> {
    let bytes = Byte::parse_str(size, /* ignore case */ true)
        .map_err(|err| err.to_string())?
        .as_u64();
    usize::try_from(bytes).map_err(|err| err.to_string())
}

/// Returns parsed command line arguments.
pub fn parse() -> CommandLineArgs {
    CommandLineArgs::parse()
}
