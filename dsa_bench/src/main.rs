use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use idxd::{DEFAULT_ENQ_RETRIES, DEFAULT_POLL_LIMIT, PollPolicy, WqMode};
use tracing_subscriber::EnvFilter;

use dsa_bench::affinity::parse_cpulist;
use dsa_bench::config::{Backend, BenchConfig, Workload};
use dsa_bench::parquet_out;

#[derive(Parser, Debug)]
#[command(name = "dsa_bench")]
#[command(about = "DSA work-queue throughput benchmark")]
struct Cli {
    /// Number of worker threads
    #[arg(short = 't', long, default_value = "32")]
    threads: usize,

    /// Comma-separated work queue names
    #[arg(
        short = 'q',
        long,
        value_delimiter = ',',
        default_value = "wq0.0,wq0.1,wq0.2,wq0.3,wq0.4,wq0.5,wq0.6,wq0.7"
    )]
    queues: Vec<String>,

    /// Submission protocol; must match the queues' configured mode
    #[arg(short = 'm', long, default_value = "shared", value_parser = parse_mode)]
    mode: WqMode,

    #[arg(short = 'w', long, value_enum, default_value = "batch")]
    workload: Workload,

    /// Rounds per worker (default: 1 for batch, unlimited for individual)
    #[arg(short = 'r', long)]
    rounds: Option<u64>,

    /// Descriptors per worker (multiple of 64)
    #[arg(short = 'n', long, default_value = "512")]
    desc_count: usize,

    /// Bytes per copy
    #[arg(short = 's', long, default_value = "512")]
    block_size: usize,

    /// Run duration in seconds
    #[arg(short = 'd', long, default_value = "10")]
    duration: u64,

    /// Cores to pin workers to, as a cpulist (e.g. 0-15,32-47)
    #[arg(long)]
    cores: Option<String>,

    /// Leave workers unpinned
    #[arg(long)]
    no_pin: bool,

    /// Shared-queue retry budget
    #[arg(long, default_value_t = DEFAULT_ENQ_RETRIES)]
    enq_retries: u32,

    /// Spin cap of the completion poller
    #[arg(long, default_value_t = DEFAULT_POLL_LIMIT)]
    poll_limit: u32,

    /// Poll completions without a spin cap
    #[arg(long)]
    unbounded_poll: bool,

    /// PASID placed in descriptors
    #[arg(long, default_value = "1")]
    pasid: u32,

    /// Physical base of the remote window, in hex
    #[arg(long, value_parser = parse_hex)]
    remote_phys: Option<u64>,

    /// Resource file mapping the remote window (e.g. a PCI BAR)
    #[arg(long)]
    remote_resource: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "hw")]
    backend: Backend,

    /// Start gate timeout in seconds
    #[arg(long, default_value = "30")]
    barrier_timeout: u64,

    /// Seconds stopped workers get to finish
    #[arg(long, default_value = "5")]
    stop_timeout: u64,

    /// Output parquet file path
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
}

fn parse_mode(s: &str) -> Result<WqMode, String> {
    s.parse::<WqMode>()
}

fn parse_hex(s: &str) -> Result<u64, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).map_err(|e| format!("{}: {}", s, e))
}

impl Cli {
    fn into_config(self) -> Result<BenchConfig, String> {
        let poll = if self.unbounded_poll {
            PollPolicy::Unbounded
        } else {
            PollPolicy::Bounded(self.poll_limit)
        };
        let mut config = BenchConfig::new()
            .with_threads(self.threads)
            .with_queues(self.queues)
            .with_mode(self.mode)
            .with_workload(self.workload)
            .with_rounds(self.rounds)
            .with_desc_count(self.desc_count)
            .with_block_size(self.block_size)
            .with_duration(Duration::from_secs(self.duration))
            .with_pin(!self.no_pin)
            .with_enq_retries(self.enq_retries)
            .with_poll(poll)
            .with_pasid(self.pasid)
            .with_backend(self.backend)
            .with_barrier_timeout(Duration::from_secs(self.barrier_timeout))
            .with_stop_timeout(Duration::from_secs(self.stop_timeout));
        if let Some(list) = &self.cores {
            config = config.with_cores(parse_cpulist(list)?);
        }
        if let Some(phys) = self.remote_phys {
            config = config.with_remote(phys, self.remote_resource);
        } else {
            config.remote_resource = self.remote_resource;
        }
        if let Some(output) = self.output {
            config = config.with_output(output);
        }
        Ok(config)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid arguments: {}", e);
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        threads = config.threads,
        queues = config.queues.len(),
        mode = %config.mode,
        workload = config.workload.as_str(),
        desc_count = config.desc_count,
        block_size = config.block_size,
        "starting benchmark"
    );

    let report = match dsa_bench::run(config.clone()) {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(error = %e, "benchmark could not start");
            eprintln!("benchmark failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(path) = &config.output {
        let rows = parquet_out::rows_from_reports(&config, &report.workers);
        match parquet_out::write_parquet(path, &rows) {
            Ok(()) => tracing::info!(path = %path.display(), rows = rows.len(), "wrote results"),
            Err(e) => tracing::error!(path = %path.display(), error = %e, "failed to write results"),
        }
    }

    match report.summary {
        Some(summary) if report.errors.is_empty() => {
            println!("{}", summary);
            ExitCode::SUCCESS
        }
        _ => {
            for e in &report.errors {
                tracing::error!(error = %e, "run failed");
            }
            eprintln!("benchmark failed: {} error(s)", report.errors.len());
            ExitCode::FAILURE
        }
    }
}
