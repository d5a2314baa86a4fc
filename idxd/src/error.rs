//! Error types for idxd.

use std::io;

use thiserror::Error;

use crate::wq::WqMode;

/// Errors from queue acquisition, memory and mapping collaborators.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error from the underlying device files.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Work queue could not be opened or mapped.
    #[error("work queue {name}: {source}")]
    QueueUnavailable {
        name: String,
        #[source]
        source: io::Error,
    },
    /// Work queue is configured in a different mode than requested.
    #[error("work queue {name} is {found}, expected {expected}")]
    ModeMismatch {
        name: String,
        expected: WqMode,
        found: String,
    },
    /// Resource window file could not be mapped.
    #[error("resource window {path}: {source}")]
    Resource {
        path: String,
        #[source]
        source: io::Error,
    },
    /// Physical range is outside every mapped resource window.
    #[error("physical range {phys:#x}+{len:#x} is outside the resource window")]
    WindowOutOfRange { phys: u64, len: usize },
    /// Allocation failed.
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory { size: usize },
    /// Mapping failed.
    #[error("DMA mapping of {len} bytes failed")]
    MapFailed { len: usize },
    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type for idxd operations.
pub type Result<T> = std::result::Result<T, Error>;
