//! Multi-threaded DSA work-queue throughput benchmark.
//!
//! A fixed number of pinned workers, each with private buffers, descriptors
//! and completion records, submit MEMMOVE work to a table of work queues and
//! spin on completion. The harness starts every worker together through a
//! start gate, times the run, and reports aggregate throughput in MIOPS.

pub mod affinity;
pub mod config;
pub mod context;
pub mod error;
pub mod gate;
pub mod harness;
pub mod parquet_out;
pub mod report;
pub mod worker;

pub use config::{Backend, BenchConfig, Target, Workload};
pub use context::{Platform, RoundOutcome, Teardown, WorkerContext};
pub use error::{Error, Result};
pub use gate::StartGate;
pub use harness::{Harness, RunReport, run};
pub use report::RunSummary;
pub use worker::{WorkerReport, WorkerState, WorkerStats};
