//! CPU and work-queue assignment for worker threads.

use std::fs;

/// Parse a cpulist string like "0-15,32-47" into a sorted Vec of core IDs.
pub fn parse_cpulist(s: &str) -> Result<Vec<usize>, String> {
    let mut cores = Vec::new();
    for part in s.trim().split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((a, b)) = part.split_once('-') {
            let (start, end) = match (a.trim().parse::<usize>(), b.trim().parse::<usize>()) {
                (Ok(start), Ok(end)) if start <= end => (start, end),
                _ => return Err(format!("bad cpu range '{}'", part)),
            };
            cores.extend(start..=end);
        } else {
            let c = part
                .parse::<usize>()
                .map_err(|_| format!("bad cpu id '{}'", part))?;
            cores.push(c);
        }
    }
    cores.sort();
    cores.dedup();
    Ok(cores)
}

/// Cores currently online.
pub fn online_cores() -> Vec<usize> {
    if let Ok(s) = fs::read_to_string("/sys/devices/system/cpu/online")
        && let Ok(cores) = parse_cpulist(&s)
        && !cores.is_empty()
    {
        return cores;
    }
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    (0..n.max(1) as usize).collect()
}

/// Core for each of `threads` workers, taken from `cores` in order.
///
/// With fewer cores than workers the list wraps around.
pub fn assign_cores(cores: &[usize], threads: usize) -> Vec<Option<usize>> {
    if cores.is_empty() {
        return vec![None; threads];
    }
    if cores.len() < threads {
        tracing::warn!(
            cores = cores.len(),
            threads,
            "fewer cores than workers; cores will be shared"
        );
    }
    (0..threads).map(|t| Some(cores[t % cores.len()])).collect()
}

/// Queue index of worker `tid` out of `threads`, spreading workers over
/// `queues` in contiguous blocks.
pub fn queue_for_worker(tid: usize, threads: usize, queues: usize) -> usize {
    debug_assert!(tid < threads && queues > 0);
    tid * queues / threads
}

/// Pin the calling thread to `core`.
pub fn pin_to_core(core: usize) -> bool {
    core_affinity::set_for_current(core_affinity::CoreId { id: core })
}
