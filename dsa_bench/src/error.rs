//! Error types for dsa_bench.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors that fail a benchmark run.
#[derive(Debug, Error)]
pub enum Error {
    /// Queue, memory or mapping collaborator failure.
    #[error(transparent)]
    Idxd(#[from] idxd::Error),
    /// IO error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Invalid benchmark configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A participant gave up on the start gate.
    #[error("start gate aborted: {0}")]
    GateAborted(String),
    /// Not every participant reached the start gate in time.
    #[error("start gate timed out after {0:?}")]
    GateTimeout(Duration),
    /// Worker thread could not be created.
    #[error("failed to spawn worker {id}: {source}")]
    Spawn {
        id: usize,
        #[source]
        source: io::Error,
    },
    /// Worker reported failure.
    #[error("worker {id} failed: {reason}")]
    Worker { id: usize, reason: String },
    /// Workers still running after the stop timeout.
    #[error("{count} worker(s) did not stop within {timeout:?}")]
    Stragglers { count: usize, timeout: Duration },
    /// Result file encoding failed.
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    /// Result file writing failed.
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
}

/// Result type for dsa_bench operations.
pub type Result<T> = std::result::Result<T, Error>;
