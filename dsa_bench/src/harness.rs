//! Benchmark harness: owns the queue table and the shared collaborators,
//! spawns pinned workers, times the run and aggregates the results.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use idxd::{
    CompletionPool, Dedicated, Portal, QueueProvider, ResourceWindow, Shared, SoftProvider,
    SubmitMode, SvaMapper, SysfsProvider, SystemAllocator, WorkQueue, WqMode,
};

use crate::affinity;
use crate::config::{Backend, BenchConfig};
use crate::context::Platform;
use crate::error::{Error, Result};
use crate::gate::StartGate;
use crate::report::RunSummary;
use crate::worker::{self, WorkerEnv, WorkerReport};

/// How often the monitor checks for finished workers.
const MONITOR_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome of one benchmark run.
#[derive(Debug)]
pub struct RunReport {
    /// Reports of the workers that were joined, by worker id.
    pub workers: Vec<WorkerReport>,
    /// Present only when the run succeeded.
    pub summary: Option<RunSummary>,
    pub errors: Vec<Error>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && self.summary.is_some()
    }
}

pub struct Harness<P: Portal, M: SubmitMode> {
    config: Arc<BenchConfig>,
    queues: Vec<Arc<WorkQueue<P, M>>>,
    platform: Arc<Platform>,
}

impl<P: Portal + 'static, M: SubmitMode> Harness<P, M> {
    /// Validate the configuration and acquire every work queue.
    pub fn new<Q>(config: BenchConfig, provider: &Q, platform: Platform) -> Result<Self>
    where
        Q: QueueProvider<Portal = P>,
    {
        config.validate()?;
        let mut queues = Vec::with_capacity(config.queues.len());
        for name in &config.queues {
            let portal = provider.acquire(name, M::MODE)?;
            tracing::info!(queue = %name, mode = %M::MODE, "acquired work queue");
            queues.push(Arc::new(WorkQueue::new(
                name.clone(),
                portal,
                config.enq_retries,
            )));
        }
        Ok(Self {
            config: Arc::new(config),
            queues,
            platform: Arc::new(platform),
        })
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    /// Run the benchmark once. Global resources are released before
    /// returning, whatever the outcome.
    pub fn run(self) -> RunReport {
        let config = self.config.clone();
        let threads = config.threads;
        let mut errors = Vec::new();

        let cores = if config.pin {
            let available = config.cores.clone().unwrap_or_else(affinity::online_cores);
            affinity::assign_cores(&available, threads)
        } else {
            vec![None; threads]
        };

        // Workers plus the harness itself.
        let gate = Arc::new(StartGate::new(threads + 1, config.barrier_timeout));
        let stop = Arc::new(AtomicBool::new(false));
        let epoch = Instant::now();

        let mut handles: Vec<(usize, JoinHandle<WorkerReport>)> = Vec::with_capacity(threads);
        for (id, core) in cores.into_iter().enumerate() {
            let queue = &self.queues[affinity::queue_for_worker(id, threads, self.queues.len())];
            let env = WorkerEnv {
                id,
                core,
                queue: queue.clone(),
                platform: self.platform.clone(),
                config: config.clone(),
                gate: gate.clone(),
                stop: stop.clone(),
                epoch,
            };
            let spawned = thread::Builder::new()
                .name(format!("dsa-worker{}", id))
                .spawn(move || worker::run(env));
            match spawned {
                Ok(h) => handles.push((id, h)),
                Err(source) => {
                    tracing::error!(worker = id, error = %source, "failed to spawn worker");
                    gate.abort(format!("worker {} could not be spawned", id));
                    errors.push(Error::Spawn { id, source });
                    break;
                }
            }
        }

        match gate.arrive() {
            Ok(()) => {
                tracing::info!(workers = threads, "all workers ready; running");
                monitor(&handles, config.duration);
            }
            Err(e) => {
                tracing::error!(error = %e, "run did not start");
                if !matches!(e, Error::GateAborted(_)) || errors.is_empty() {
                    errors.push(e);
                }
            }
        }
        stop.store(true, Ordering::Relaxed);

        let workers = collect(handles, config.stop_timeout, &mut errors);
        for r in &workers {
            if !r.is_success() {
                errors.push(Error::Worker {
                    id: r.id,
                    reason: r.error.clone().unwrap_or_else(|| r.state.as_str().into()),
                });
            }
        }

        let summary = if errors.is_empty() {
            RunSummary::from_reports(&workers)
        } else {
            None
        };

        // Detached stragglers keep their own references alive.
        drop(self.queues);
        drop(self.platform);
        tracing::debug!("released global resources");

        RunReport {
            workers,
            summary,
            errors,
        }
    }
}

/// Wait for the run duration, or until every worker has finished.
fn monitor(handles: &[(usize, JoinHandle<WorkerReport>)], duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        if handles.iter().all(|(_, h)| h.is_finished()) {
            tracing::debug!("all workers finished early");
            return;
        }
        thread::sleep(MONITOR_INTERVAL.min(duration.saturating_sub(start.elapsed())));
    }
}

/// Join every worker that stops within `timeout`; detach the rest.
fn collect(
    handles: Vec<(usize, JoinHandle<WorkerReport>)>,
    timeout: Duration,
    errors: &mut Vec<Error>,
) -> Vec<WorkerReport> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline && !handles.iter().all(|(_, h)| h.is_finished()) {
        thread::sleep(MONITOR_INTERVAL);
    }

    let mut reports = Vec::with_capacity(handles.len());
    let mut stragglers = 0;
    for (id, h) in handles {
        if !h.is_finished() {
            tracing::error!(worker = id, "worker did not stop; detaching");
            stragglers += 1;
            continue;
        }
        match h.join() {
            Ok(report) => reports.push(report),
            Err(_) => {
                tracing::error!(worker = id, "worker panicked");
                errors.push(Error::Worker {
                    id,
                    reason: "panicked".into(),
                });
            }
        }
    }
    if stragglers > 0 {
        errors.push(Error::Stragglers {
            count: stragglers,
            timeout,
        });
    }
    reports
}

fn platform_for(config: &BenchConfig) -> Result<Platform> {
    let mapper = match (config.remote_phys, &config.remote_resource, config.backend) {
        (None, _, _) => SvaMapper::new(),
        (Some(phys), Some(path), _) => {
            SvaMapper::with_window(ResourceWindow::open(path, phys, config.window_len())?)
        }
        (Some(phys), None, Backend::Soft) => {
            SvaMapper::with_window(ResourceWindow::emulated(phys, config.window_len())?)
        }
        (Some(_), None, Backend::Hw) => {
            return Err(Error::Config("remote window needs a resource file".into()));
        }
    };
    let pool = CompletionPool::new();
    pool.reserve(config.threads * config.records_per_worker())?;
    Ok(Platform {
        host: Arc::new(SystemAllocator),
        mapper: Arc::new(mapper),
        comps: Arc::new(pool),
    })
}

fn run_mode<Q, M>(config: BenchConfig, provider: &Q) -> Result<RunReport>
where
    Q: QueueProvider,
    M: SubmitMode,
{
    let platform = platform_for(&config)?;
    let harness = Harness::<Q::Portal, M>::new(config, provider, platform)?;
    Ok(harness.run())
}

fn run_with<Q: QueueProvider>(config: BenchConfig, provider: &Q) -> Result<RunReport> {
    match config.mode {
        WqMode::Dedicated => run_mode::<Q, Dedicated>(config, provider),
        WqMode::Shared => run_mode::<Q, Shared>(config, provider),
    }
}

/// Run the benchmark described by `config` on its configured backend.
pub fn run(config: BenchConfig) -> Result<RunReport> {
    config.validate()?;
    match config.backend {
        Backend::Hw => run_with(config, &SysfsProvider::new()),
        Backend::Soft => {
            let provider = SoftProvider::new(config.mode);
            run_with(config, &provider)
        }
    }
}
