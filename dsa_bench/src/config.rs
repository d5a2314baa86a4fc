//! Benchmark configuration.

use std::path::PathBuf;
use std::time::Duration;

use idxd::{
    DEFAULT_ENQ_RETRIES, DEFAULT_POLL_LIMIT, MAX_BATCH_SIZE, MIN_BATCH_SIZE, PollPolicy, WqMode,
};

use crate::error::{Error, Result};

/// Descriptors per worker must be a multiple of this.
pub const DESC_GRANULE: usize = 64;

/// What one round of a worker submits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Workload {
    /// Every descriptor submitted on its own, then polled in order.
    Individual,
    /// All descriptors wrapped in one batch descriptor.
    Batch,
}

impl Workload {
    pub fn as_str(&self) -> &'static str {
        match self {
            Workload::Individual => "individual",
            Workload::Batch => "batch",
        }
    }
}

/// Where work queues come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// User-space portals under /dev/dsa.
    Hw,
    /// Software-emulated queues.
    Soft,
}

/// Destination of the copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The worker's own destination buffer.
    Host,
    /// The worker's slice of a remote resource window starting at `phys`.
    Remote { phys: u64 },
}

/// Benchmark configuration.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Worker thread count.
    /// Default: 32
    pub threads: usize,
    /// Work queue names; workers are spread over them in contiguous blocks.
    /// Default: wq0.0 .. wq0.7
    pub queues: Vec<String>,
    /// Submission protocol; must match the queues' configured mode.
    /// Default: shared
    pub mode: WqMode,
    /// Default: batch
    pub workload: Workload,
    /// Rounds per worker; `None` runs until stopped.
    /// Default: 1 for batch, unlimited for individual
    pub rounds: Option<u64>,
    /// Descriptors per worker.
    /// Default: 512
    pub desc_count: usize,
    /// Bytes per copy.
    /// Default: 512
    pub block_size: usize,
    /// Run duration.
    /// Default: 10s
    pub duration: Duration,
    /// Cores to pin workers to; `None` uses the online cores.
    pub cores: Option<Vec<usize>>,
    /// Pin workers to cores.
    /// Default: true
    pub pin: bool,
    /// Shared-queue retry budget.
    /// Default: 32
    pub enq_retries: u32,
    /// Completion poller policy.
    /// Default: bounded, 200000 spins
    pub poll: PollPolicy,
    /// PASID placed in descriptors.
    /// Default: 1
    pub pasid: u32,
    /// Physical base of the remote window; `None` copies host to host.
    pub remote_phys: Option<u64>,
    /// Resource file backing the remote window (hardware backend).
    pub remote_resource: Option<PathBuf>,
    /// Default: hw
    pub backend: Backend,
    /// How long the start gate waits for every worker.
    /// Default: 30s
    pub barrier_timeout: Duration,
    /// How long stopped workers get to finish.
    /// Default: 5s
    pub stop_timeout: Duration,
    /// Parquet file for per-worker rows.
    pub output: Option<PathBuf>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            threads: 32,
            queues: (0..8).map(|q| format!("wq0.{}", q)).collect(),
            mode: WqMode::Shared,
            workload: Workload::Batch,
            rounds: None,
            desc_count: 512,
            block_size: 512,
            duration: Duration::from_secs(10),
            cores: None,
            pin: true,
            enq_retries: DEFAULT_ENQ_RETRIES,
            poll: PollPolicy::Bounded(DEFAULT_POLL_LIMIT),
            pasid: 1,
            remote_phys: None,
            remote_resource: None,
            backend: Backend::Hw,
            barrier_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(5),
            output: None,
        }
    }
}

impl BenchConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mode(mut self, mode: WqMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_workload(mut self, workload: Workload) -> Self {
        self.workload = workload;
        self
    }

    pub fn with_rounds(mut self, rounds: Option<u64>) -> Self {
        self.rounds = rounds;
        self
    }

    pub fn with_desc_count(mut self, desc_count: usize) -> Self {
        self.desc_count = desc_count;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_cores(mut self, cores: Vec<usize>) -> Self {
        self.cores = Some(cores);
        self
    }

    /// Enable or disable core pinning.
    pub fn with_pin(mut self, pin: bool) -> Self {
        self.pin = pin;
        self
    }

    pub fn with_enq_retries(mut self, enq_retries: u32) -> Self {
        self.enq_retries = enq_retries;
        self
    }

    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_pasid(mut self, pasid: u32) -> Self {
        self.pasid = pasid;
        self
    }

    /// Copy into a remote window at `phys`, optionally backed by a resource
    /// file.
    pub fn with_remote(mut self, phys: u64, resource: Option<PathBuf>) -> Self {
        self.remote_phys = Some(phys);
        self.remote_resource = resource;
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_barrier_timeout(mut self, timeout: Duration) -> Self {
        self.barrier_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_output(mut self, output: PathBuf) -> Self {
        self.output = Some(output);
        self
    }

    /// Rounds per worker after applying the workload default.
    pub fn effective_rounds(&self) -> Option<u64> {
        match (self.rounds, self.workload) {
            (Some(r), _) => Some(r),
            (None, Workload::Batch) => Some(1),
            (None, Workload::Individual) => None,
        }
    }

    pub fn target(&self) -> Target {
        match self.remote_phys {
            Some(phys) => Target::Remote { phys },
            None => Target::Host,
        }
    }

    /// Bytes of remote window covering every worker's slice.
    pub fn window_len(&self) -> usize {
        self.threads * self.block_size
    }

    /// Completion records each worker holds (one per descriptor plus the
    /// batch record).
    pub fn records_per_worker(&self) -> usize {
        self.desc_count + 1
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(Error::Config(msg));
        if self.threads == 0 {
            return bad("at least one worker is required".into());
        }
        if self.queues.is_empty() {
            return bad("at least one work queue is required".into());
        }
        if self.desc_count == 0 || self.desc_count % DESC_GRANULE != 0 {
            return bad(format!(
                "descriptor count {} is not a positive multiple of {}",
                self.desc_count, DESC_GRANULE
            ));
        }
        if self.workload == Workload::Batch && (self.desc_count as u64) < MIN_BATCH_SIZE as u64 {
            return bad(format!("a batch needs at least {} descriptors", MIN_BATCH_SIZE));
        }
        if self.workload == Workload::Batch && (self.desc_count as u64) > MAX_BATCH_SIZE as u64 {
            return bad(format!(
                "a batch carries at most {} descriptors, got {}",
                MAX_BATCH_SIZE, self.desc_count
            ));
        }
        // A dedicated queue has exactly one submitter.
        if self.mode == WqMode::Dedicated && self.threads > self.queues.len() {
            return bad(format!(
                "{} workers cannot share {} dedicated queue(s)",
                self.threads,
                self.queues.len()
            ));
        }
        if self.block_size == 0 || u32::try_from(self.block_size).is_err() {
            return bad(format!("block size {} out of range", self.block_size));
        }
        if self.rounds == Some(0) {
            return bad("rounds must be at least 1".into());
        }
        if let Some(cores) = &self.cores
            && cores.len() < self.threads
        {
            return bad(format!(
                "{} cores listed for {} workers",
                cores.len(),
                self.threads
            ));
        }
        if self.backend == Backend::Hw && self.remote_phys.is_some() && self.remote_resource.is_none()
        {
            return bad("a remote window on hardware needs --remote-resource".into());
        }
        if self.remote_resource.is_some() && self.remote_phys.is_none() {
            return bad("--remote-resource needs --remote-phys".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let c = BenchConfig::default();
        assert!(c.validate().is_ok());
        assert_eq!(c.queues.len(), 8);
        assert_eq!(c.queues[7], "wq0.7");
        assert_eq!(c.effective_rounds(), Some(1));
        assert_eq!(c.target(), Target::Host);
        assert_eq!(c.records_per_worker(), 513);
    }

    #[test]
    fn test_individual_runs_until_stopped() {
        let c = BenchConfig::new().with_workload(Workload::Individual);
        assert_eq!(c.effective_rounds(), None);
        let c = c.with_rounds(Some(3));
        assert_eq!(c.effective_rounds(), Some(3));
    }

    #[test]
    fn test_rejects_bad_desc_count() {
        for n in [0, 63, 100] {
            let c = BenchConfig::new().with_desc_count(n);
            assert!(matches!(c.validate(), Err(Error::Config(_))), "{}", n);
        }
        assert!(BenchConfig::new().with_desc_count(64).validate().is_ok());
    }

    #[test]
    fn test_remote_window_requirements() {
        let c = BenchConfig::new().with_remote(0x2030_0000_0000, None);
        assert!(c.validate().is_err());
        let c = c.with_backend(Backend::Soft);
        assert!(c.validate().is_ok());
        assert_eq!(
            c.target(),
            Target::Remote {
                phys: 0x2030_0000_0000
            }
        );
        assert_eq!(c.window_len(), 32 * 512);
    }

    #[test]
    fn test_dedicated_queue_has_one_worker() {
        let c = BenchConfig::new()
            .with_threads(4)
            .with_queues(["wq0.0"])
            .with_mode(WqMode::Dedicated);
        assert!(matches!(c.validate(), Err(Error::Config(_))));

        let c = c.with_queues(["wq0.0", "wq0.1", "wq0.2", "wq0.3"]);
        assert!(c.validate().is_ok());
        // Shared queues take any number of submitters.
        let c = c.with_queues(["wq0.0"]).with_mode(WqMode::Shared);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_rejects_oversized_batch() {
        let c = BenchConfig::new().with_desc_count(2048);
        assert!(matches!(c.validate(), Err(Error::Config(_))));
        assert!(BenchConfig::new().with_desc_count(1024).validate().is_ok());
        // Individual rounds are not bound by the batch limit.
        let c = c.with_workload(Workload::Individual);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_rejects_short_core_list() {
        let c = BenchConfig::new().with_threads(4).with_cores(vec![0, 1]);
        assert!(c.validate().is_err());
    }
}
