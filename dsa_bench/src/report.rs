//! Aggregation of worker results into a throughput figure.

use crate::worker::WorkerReport;

/// Run-wide totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Earliest worker start, nanoseconds since the harness epoch.
    pub earliest_start_ns: u64,
    /// Latest worker end, nanoseconds since the harness epoch.
    pub latest_end_ns: u64,
    /// Operations completed successfully by all workers.
    pub total_completed: u64,
}

impl RunSummary {
    /// Aggregate `(start_ns, end_ns, completed)` samples. `None` when empty.
    pub fn from_samples(samples: impl IntoIterator<Item = (u64, u64, u64)>) -> Option<Self> {
        samples
            .into_iter()
            .fold(None, |acc: Option<Self>, (start, end, completed)| {
                Some(match acc {
                    None => Self {
                        earliest_start_ns: start,
                        latest_end_ns: end,
                        total_completed: completed,
                    },
                    Some(s) => Self {
                        earliest_start_ns: s.earliest_start_ns.min(start),
                        latest_end_ns: s.latest_end_ns.max(end),
                        total_completed: s.total_completed + completed,
                    },
                })
            })
    }

    pub fn from_reports(reports: &[WorkerReport]) -> Option<Self> {
        Self::from_samples(
            reports
                .iter()
                .map(|r| (r.start_ns, r.end_ns, r.stats.completed)),
        )
    }

    pub fn elapsed_ns(&self) -> u64 {
        self.latest_end_ns.saturating_sub(self.earliest_start_ns)
    }

    pub fn elapsed_us(&self) -> u64 {
        self.elapsed_ns() / 1000
    }

    /// Throughput in MIOPS as (integer part, thousandths).
    pub fn miops(&self) -> (u64, u64) {
        let ns = self.elapsed_ns() as u128;
        if ns == 0 {
            return (0, 0);
        }
        let n = self.total_completed as u128;
        ((n * 1000 / ns) as u64, ((n * 1_000_000 / ns) % 1000) as u64)
    }

    /// Throughput in MIOPS as a float, for result files.
    pub fn miops_f64(&self) -> f64 {
        let ns = self.elapsed_ns();
        if ns == 0 {
            return 0.0;
        }
        self.total_completed as f64 * 1000.0 / ns as f64
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (whole, frac) = self.miops();
        writeln!(f, "io: {}", self.total_completed)?;
        writeln!(f, "elapsed: {} μs", self.elapsed_us())?;
        write!(f, "bandwidth: {}.{:03} MIOPS", whole, frac)
    }
}
