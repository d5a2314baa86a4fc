//! Work queues and descriptor submission.
//!
//! A work queue is reached through a portal: a write-only MMIO page. How a
//! descriptor is written there depends on how the queue was configured, and
//! a queue never changes kind while in use:
//!
//! - **Dedicated** queues are owned by one submitter. A single 64-byte
//!   posted write (`MOVDIR64B`) always lands.
//! - **Shared** queues accept descriptors from many submitters. `ENQCMD`
//!   reports whether the device accepted the descriptor; when the queue is
//!   momentarily full the submitter relaxes and retries within a per-queue
//!   budget.
//!
//! The mode is a type parameter ([`Dedicated`] / [`Shared`]) so the choice is
//! made once at configuration time and the hot path carries no branch on it.

use std::marker::PhantomData;

use thiserror::Error;

use crate::desc::HwDesc;
use crate::error::Result;

/// Default retry budget of a shared queue.
pub const DEFAULT_ENQ_RETRIES: u32 = 32;

/// Work queue configuration mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WqMode {
    Dedicated,
    Shared,
}

impl std::fmt::Display for WqMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WqMode::Dedicated => f.write_str("dedicated"),
            WqMode::Shared => f.write_str("shared"),
        }
    }
}

impl std::str::FromStr for WqMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "dedicated" => Ok(WqMode::Dedicated),
            "shared" => Ok(WqMode::Shared),
            other => Err(format!("unknown work queue mode: {other}")),
        }
    }
}

/// Result of a single enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Accepted,
    /// Queue full; try again.
    Retry,
    /// The portal cannot take descriptors at all.
    Fault(i32),
}

/// Submission failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The queue stayed full for the whole retry budget.
    #[error("work queue busy")]
    Busy,
    /// Unexpected submission failure.
    #[error("submission failed (rc {0})")]
    Fatal(i32),
}

impl SubmitError {
    /// Whether the caller may simply try again later.
    pub fn is_transient(&self) -> bool {
        matches!(self, SubmitError::Busy)
    }

    /// Kernel-style return code (`-EAGAIN` for busy).
    pub fn code(&self) -> i32 {
        match self {
            SubmitError::Busy => -libc::EAGAIN,
            SubmitError::Fatal(rc) => *rc,
        }
    }
}

/// Raw submission primitives of a work-queue portal.
pub trait Portal: Send + Sync {
    /// 64-byte posted write of `desc` (dedicated queues).
    fn write64(&self, desc: &HwDesc);

    /// One enqueue attempt of `desc` (shared queues).
    fn enqueue(&self, desc: &HwDesc) -> Enqueue;
}

/// Submission protocol of a queue.
pub trait SubmitMode: Send + Sync + 'static {
    const MODE: WqMode;

    fn submit<P: Portal>(portal: &P, retries: u32, desc: &HwDesc) -> std::result::Result<(), SubmitError>;
}

/// Dedicated-queue protocol: one atomic 64-byte write, never rejected.
#[derive(Debug, Clone, Copy)]
pub struct Dedicated;

/// Shared-queue protocol: enqueue, retrying while the queue is full.
#[derive(Debug, Clone, Copy)]
pub struct Shared;

impl SubmitMode for Dedicated {
    const MODE: WqMode = WqMode::Dedicated;

    #[inline]
    fn submit<P: Portal>(portal: &P, _retries: u32, desc: &HwDesc) -> std::result::Result<(), SubmitError> {
        wmb!();
        portal.write64(desc);
        Ok(())
    }
}

impl SubmitMode for Shared {
    const MODE: WqMode = WqMode::Shared;

    /// A budget of `retries` allows `retries + 1` attempts.
    #[inline]
    fn submit<P: Portal>(portal: &P, retries: u32, desc: &HwDesc) -> std::result::Result<(), SubmitError> {
        wmb!();
        let mut left = retries;
        loop {
            match portal.enqueue(desc) {
                Enqueue::Accepted => return Ok(()),
                Enqueue::Fault(rc) => return Err(SubmitError::Fatal(rc)),
                Enqueue::Retry => {
                    if left == 0 {
                        return Err(SubmitError::Busy);
                    }
                    left -= 1;
                    std::hint::spin_loop();
                }
            }
        }
    }
}

/// Hardware work queue handle: a portal plus its submission protocol.
///
/// Several workers may share one handle (behind an `Arc`); the device's
/// enqueue semantics are the only synchronization a shared queue needs.
pub struct WorkQueue<P: Portal, M: SubmitMode> {
    name: String,
    portal: P,
    retries: u32,
    _mode: PhantomData<M>,
}

impl<P: Portal, M: SubmitMode> WorkQueue<P, M> {
    pub fn new(name: impl Into<String>, portal: P, retries: u32) -> Self {
        Self {
            name: name.into(),
            portal,
            retries,
            _mode: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> WqMode {
        M::MODE
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn portal(&self) -> &P {
        &self.portal
    }

    /// Submit one descriptor (ordinary or batch).
    #[inline]
    pub fn submit(&self, desc: &HwDesc) -> std::result::Result<(), SubmitError> {
        M::submit(&self.portal, self.retries, desc)
    }
}

impl<P: Portal, M: SubmitMode> std::fmt::Debug for WorkQueue<P, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .field("mode", &M::MODE)
            .field("retries", &self.retries)
            .finish()
    }
}

/// Source of work-queue portals, keyed by queue name.
///
/// Dropping the returned portal releases the queue.
pub trait QueueProvider {
    type Portal: Portal + 'static;

    fn acquire(&self, name: &str, mode: WqMode) -> Result<Self::Portal>;
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Rejects the first `rejects` enqueue attempts.
    struct FlakyPortal {
        rejects: u32,
        attempts: AtomicU32,
        writes: Mutex<Vec<HwDesc>>,
        fault: Option<i32>,
    }

    impl FlakyPortal {
        fn new(rejects: u32) -> Self {
            Self {
                rejects,
                attempts: AtomicU32::new(0),
                writes: Mutex::new(Vec::new()),
                fault: None,
            }
        }
    }

    impl Portal for FlakyPortal {
        fn write64(&self, desc: &HwDesc) {
            self.writes.lock().unwrap().push(*desc);
        }

        fn enqueue(&self, desc: &HwDesc) -> Enqueue {
            let n = self.attempts.fetch_add(1, Ordering::Relaxed);
            if let Some(rc) = self.fault {
                return Enqueue::Fault(rc);
            }
            if n < self.rejects {
                Enqueue::Retry
            } else {
                self.writes.lock().unwrap().push(*desc);
                Enqueue::Accepted
            }
        }
    }

    #[test]
    fn test_shared_succeeds_within_budget() {
        for rejects in 0..=4 {
            let wq: WorkQueue<_, Shared> = WorkQueue::new("wq0.0", FlakyPortal::new(rejects), 4);
            assert_eq!(wq.submit(&HwDesc::zeroed()), Ok(()));
            assert_eq!(wq.portal().attempts.load(Ordering::Relaxed), rejects + 1);
            assert_eq!(wq.portal().writes.lock().unwrap().len(), 1);
        }
    }

    #[test]
    fn test_shared_busy_after_budget_is_not_fatal() {
        let wq: WorkQueue<_, Shared> = WorkQueue::new("wq0.0", FlakyPortal::new(u32::MAX), 4);
        let err = wq.submit(&HwDesc::zeroed()).unwrap_err();
        assert_eq!(err, SubmitError::Busy);
        assert!(err.is_transient());
        assert_eq!(err.code(), -libc::EAGAIN);
        assert_eq!(wq.portal().attempts.load(Ordering::Relaxed), 5);
        assert!(wq.portal().writes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_shared_zero_budget_single_attempt() {
        let wq: WorkQueue<_, Shared> = WorkQueue::new("wq0.0", FlakyPortal::new(1), 0);
        assert_eq!(wq.submit(&HwDesc::zeroed()), Err(SubmitError::Busy));
        assert_eq!(wq.portal().attempts.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_shared_fault_is_fatal() {
        let mut portal = FlakyPortal::new(0);
        portal.fault = Some(-libc::EIO);
        let wq: WorkQueue<_, Shared> = WorkQueue::new("wq0.0", portal, 4);
        let err = wq.submit(&HwDesc::zeroed()).unwrap_err();
        assert_eq!(err, SubmitError::Fatal(-libc::EIO));
        assert!(!err.is_transient());
        assert_eq!(wq.portal().attempts.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_dedicated_writes_once() {
        let wq: WorkQueue<_, Dedicated> = WorkQueue::new("wq0.1", FlakyPortal::new(u32::MAX), 4);
        assert_eq!(wq.mode(), WqMode::Dedicated);
        assert_eq!(wq.submit(&HwDesc::zeroed()), Ok(()));
        assert_eq!(wq.portal().attempts.load(Ordering::Relaxed), 0);
        assert_eq!(wq.portal().writes.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("dedicated".parse::<WqMode>(), Ok(WqMode::Dedicated));
        assert_eq!("shared\n".parse::<WqMode>(), Ok(WqMode::Shared));
        assert!("bogus".parse::<WqMode>().is_err());
    }
}
