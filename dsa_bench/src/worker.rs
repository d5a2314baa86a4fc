//! Worker thread body.
//!
//! A worker walks `Uninitialized -> Ready -> Running -> Draining -> TornDown`:
//! it builds its context, waits at the start gate, runs rounds until its
//! workload is done or the harness asks it to stop, then drains and releases
//! everything it acquired.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use idxd::{Portal, SubmitMode, WorkQueue};

use crate::affinity;
use crate::config::BenchConfig;
use crate::context::{Platform, RoundOutcome, Teardown, WorkerContext};
use crate::gate::StartGate;

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninitialized,
    Ready,
    Running,
    Draining,
    TornDown,
    /// Setup failed, the gate was abandoned, or work was left in flight.
    Failed,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Uninitialized => "uninitialized",
            WorkerState::Ready => "ready",
            WorkerState::Running => "running",
            WorkerState::Draining => "draining",
            WorkerState::TornDown => "torn-down",
            WorkerState::Failed => "failed",
        }
    }
}

/// Operation counters of one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Operations completed successfully.
    pub completed: u64,
    /// Operations that completed with a fault.
    pub failed: u64,
    /// Descriptors accepted by the queue (a batch counts once).
    pub submitted: u64,
    /// Submissions abandoned because the queue stayed full.
    pub busy: u64,
    /// Submissions that failed outright.
    pub fatal: u64,
    /// Rounds finished.
    pub rounds: u64,
    /// Completions observed while draining, after the end timestamp.
    pub drained: u64,
}

/// What a worker hands back to the harness.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub id: usize,
    pub core: Option<usize>,
    pub queue: String,
    /// Nanoseconds since the harness epoch at `Ready -> Running`.
    pub start_ns: u64,
    /// Nanoseconds since the harness epoch at `Running -> Draining`.
    pub end_ns: u64,
    pub stats: WorkerStats,
    pub state: WorkerState,
    pub error: Option<String>,
}

impl WorkerReport {
    fn new(id: usize, core: Option<usize>, queue: &str) -> Self {
        Self {
            id,
            core,
            queue: queue.to_string(),
            start_ns: 0,
            end_ns: 0,
            stats: WorkerStats::default(),
            state: WorkerState::Uninitialized,
            error: None,
        }
    }

    fn fail(mut self, reason: String) -> Self {
        self.state = WorkerState::Failed;
        self.error = Some(reason);
        self
    }

    pub fn is_success(&self) -> bool {
        self.state == WorkerState::TornDown
    }
}

/// Everything a worker thread needs, moved into it at spawn.
pub struct WorkerEnv<P: Portal, M: SubmitMode> {
    pub id: usize,
    pub core: Option<usize>,
    pub queue: Arc<WorkQueue<P, M>>,
    pub platform: Arc<Platform>,
    pub config: Arc<BenchConfig>,
    pub gate: Arc<StartGate>,
    pub stop: Arc<AtomicBool>,
    pub epoch: Instant,
}

fn since(epoch: Instant) -> u64 {
    epoch.elapsed().as_nanos() as u64
}

/// Worker thread entry point.
pub fn run<P: Portal + 'static, M: SubmitMode>(env: WorkerEnv<P, M>) -> WorkerReport {
    let WorkerEnv {
        id,
        core,
        queue,
        platform,
        config,
        gate,
        stop,
        epoch,
    } = env;
    let mut report = WorkerReport::new(id, core, queue.name());

    if let Some(core) = core
        && !affinity::pin_to_core(core)
    {
        tracing::warn!(worker = id, core, "failed to pin worker");
    }

    let mut ctx = match WorkerContext::setup(id, queue, &platform, &config) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!(worker = id, error = %e, "worker setup failed");
            gate.abort(format!("worker {} setup failed: {}", id, e));
            return report.fail(format!("setup: {}", e));
        }
    };
    report.state = WorkerState::Ready;

    if let Err(e) = gate.arrive() {
        tracing::debug!(worker = id, error = %e, "leaving start gate");
        // Context released here, nothing was submitted.
        drop(ctx);
        return report.fail(e.to_string());
    }

    report.state = WorkerState::Running;
    report.start_ns = since(epoch);
    let rounds = config.effective_rounds();
    let mut stalled = false;
    while !stop.load(Ordering::Relaxed) {
        if rounds.is_some_and(|r| report.stats.rounds >= r) {
            break;
        }
        if ctx.run_round(&mut report.stats) == RoundOutcome::Stalled {
            stalled = true;
            break;
        }
    }
    report.end_ns = since(epoch);
    report.state = WorkerState::Draining;

    match ctx.finish(&mut report.stats) {
        Teardown::Released => {}
        Teardown::Leaked(outstanding) => {
            return report.fail(format!(
                "{} operation(s) still in flight; context leaked",
                outstanding
            ));
        }
    }
    if stalled {
        return report.fail("completion poll timed out".into());
    }
    report.state = WorkerState::TornDown;
    tracing::debug!(
        worker = id,
        completed = report.stats.completed,
        rounds = report.stats.rounds,
        "worker finished"
    );
    report
}
