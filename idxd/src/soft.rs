//! Software-emulated work queues.
//!
//! [`SoftPortal`] executes descriptors synchronously at submission time
//! against host memory, the way the device would with shared virtual
//! addressing: every address in a descriptor is a process virtual address.
//! Completion records are written field by field with the status byte last,
//! so pollers observe exactly what hardware would post.
//!
//! Supported operations are NOOP, DRAIN, MEMMOVE and BATCH (of the former).
//! Anything else completes with [`StatusCode::BadOpcode`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::batch::{MAX_BATCH_SIZE, MIN_BATCH_SIZE};
use crate::comp::{CompletionRecord, STATUS_WRITE_FAULT, StatusCode};
use crate::desc::{DescFlags, HwDesc, Opcode};
use crate::error::{Error, Result};
use crate::wq::{Enqueue, Portal, QueueProvider, WqMode};

/// Default largest batch the emulated device accepts.
pub const DEFAULT_MAX_BATCH: u32 = MAX_BATCH_SIZE;

/// Behavior knobs of an emulated queue.
#[derive(Debug, Clone, Copy)]
pub struct SoftConfig {
    /// Largest descriptor count accepted in a batch.
    pub max_batch: u32,
    /// Reject every n-th enqueue as "queue full" (0 disables).
    pub busy_every: u32,
    /// Accept descriptors without ever completing them.
    pub stall: bool,
}

impl Default for SoftConfig {
    fn default() -> Self {
        Self {
            max_batch: DEFAULT_MAX_BATCH,
            busy_every: 0,
            stall: false,
        }
    }
}

/// Counters of one emulated queue.
#[derive(Debug, Default)]
pub struct SoftStats {
    /// Descriptors accepted through the portal.
    submitted: AtomicU64,
    /// Enqueue attempts rejected as queue full.
    rejected: AtomicU64,
    /// Operations executed, counting batch elements individually.
    executed: AtomicU64,
    /// Operations that completed with a non-success status.
    faulted: AtomicU64,
}

impl SoftStats {
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn faulted(&self) -> u64 {
        self.faulted.load(Ordering::Relaxed)
    }
}

/// Outcome of one executed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Outcome {
    status: u8,
    bytes: u32,
    fault_addr: u64,
}

impl Outcome {
    fn success(bytes: u32) -> Self {
        Self {
            status: StatusCode::Success as u8,
            bytes,
            fault_addr: 0,
        }
    }

    fn error(code: StatusCode) -> Self {
        Self {
            status: code as u8,
            bytes: 0,
            fault_addr: 0,
        }
    }

    fn fault(addr: u64, write: bool) -> Self {
        let mut status = StatusCode::PageFaultNoBof as u8;
        if write {
            status |= STATUS_WRITE_FAULT;
        }
        Self {
            status,
            bytes: 0,
            fault_addr: addr,
        }
    }

    fn is_success(&self) -> bool {
        self.status == StatusCode::Success as u8
    }
}

/// Portal of an emulated work queue.
pub struct SoftPortal {
    name: String,
    config: SoftConfig,
    attempts: AtomicU32,
    stats: Arc<SoftStats>,
}

impl SoftPortal {
    pub fn new(name: impl Into<String>, config: SoftConfig) -> Self {
        Self::with_stats(name, config, Arc::new(SoftStats::default()))
    }

    fn with_stats(name: impl Into<String>, config: SoftConfig, stats: Arc<SoftStats>) -> Self {
        Self {
            name: name.into(),
            config,
            attempts: AtomicU32::new(0),
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &SoftStats {
        &self.stats
    }

    fn accept(&self, desc: &HwDesc) {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        if self.config.stall {
            return;
        }
        // SAFETY: descriptors carry live process addresses (shared virtual
        // addressing); the submitter keeps them valid until completion.
        unsafe { self.execute(desc) };
    }

    unsafe fn execute(&self, desc: &HwDesc) {
        let outcome = match desc.opcode() {
            Some(Opcode::Batch) => unsafe { self.run_batch(desc) },
            _ => unsafe { self.run_single(desc) },
        };
        unsafe { post(desc, outcome) };
    }

    unsafe fn run_single(&self, desc: &HwDesc) -> Outcome {
        self.stats.executed.fetch_add(1, Ordering::Relaxed);
        let outcome = match desc.opcode() {
            Some(Opcode::Noop) | Some(Opcode::Drain) => Outcome::success(0),
            Some(Opcode::MemMove) => unsafe { memmove(desc) },
            // Batches cannot nest.
            _ => Outcome::error(StatusCode::BadOpcode),
        };
        if !outcome.is_success() {
            self.stats.faulted.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    unsafe fn run_batch(&self, desc: &HwDesc) -> Outcome {
        let count = desc.desc_count();
        if count < MIN_BATCH_SIZE || count > self.config.max_batch {
            self.stats.faulted.fetch_add(1, Ordering::Relaxed);
            return Outcome::error(StatusCode::DescCntErange);
        }
        let list = desc.desc_list_addr().0;
        if list == 0 {
            self.stats.faulted.fetch_add(1, Ordering::Relaxed);
            return Outcome::fault(list, false);
        }
        if list % std::mem::align_of::<HwDesc>() as u64 != 0 {
            self.stats.faulted.fetch_add(1, Ordering::Relaxed);
            return Outcome::error(StatusCode::DescListAlign);
        }

        let list = list as *const HwDesc;
        let mut completed = 0u32;
        for i in 0..count as usize {
            let elem = unsafe { std::ptr::read_volatile(list.add(i)) };
            let outcome = unsafe { self.run_single(&elem) };
            if outcome.is_success() {
                completed += 1;
            }
            unsafe { post(&elem, outcome) };
        }
        if completed == count {
            Outcome::success(completed)
        } else {
            Outcome {
                status: StatusCode::BatchFail as u8,
                bytes: completed,
                fault_addr: 0,
            }
        }
    }
}

unsafe fn memmove(desc: &HwDesc) -> Outcome {
    let src = desc.src_addr().0;
    let dst = desc.dst_addr().0;
    let len = desc.xfer_size();
    if src == 0 {
        return Outcome::fault(src, false);
    }
    if dst == 0 {
        return Outcome::fault(dst, true);
    }
    unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, len as usize) };
    Outcome::success(len)
}

/// Write the completion record of `desc`, status byte last.
unsafe fn post(desc: &HwDesc, outcome: Outcome) {
    let flags = desc.flags();
    let addr = desc.completion_addr().0;
    if !flags.contains(DescFlags::RCR) || addr == 0 {
        return;
    }
    let rec = addr as *mut CompletionRecord;
    unsafe {
        std::ptr::write_volatile(std::ptr::addr_of_mut!((*rec).bytes_completed), outcome.bytes);
        std::ptr::write_volatile(std::ptr::addr_of_mut!((*rec).fault_addr), outcome.fault_addr);
        std::sync::atomic::fence(Ordering::Release);
        std::ptr::write_volatile(std::ptr::addr_of_mut!((*rec).status), outcome.status);
    }
}

impl Portal for SoftPortal {
    fn write64(&self, desc: &HwDesc) {
        self.accept(desc);
    }

    fn enqueue(&self, desc: &HwDesc) -> Enqueue {
        let n = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        if self.config.busy_every != 0 && n % self.config.busy_every == 0 {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Enqueue::Retry;
        }
        self.accept(desc);
        Enqueue::Accepted
    }
}

impl std::fmt::Debug for SoftPortal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftPortal")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

/// Hands out emulated queues, all configured in one mode.
///
/// Counters survive the portals so a caller can inspect them after a run.
pub struct SoftProvider {
    mode: WqMode,
    config: SoftConfig,
    known: Option<Vec<String>>,
    unavailable: AtomicBool,
    stats: Mutex<HashMap<String, Arc<SoftStats>>>,
}

impl SoftProvider {
    /// Every queue name is valid and configured as `mode`.
    pub fn new(mode: WqMode) -> Self {
        Self {
            mode,
            config: SoftConfig::default(),
            known: None,
            unavailable: AtomicBool::new(false),
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: SoftConfig) -> Self {
        self.config = config;
        self
    }

    /// Restrict the provider to the given queue names.
    pub fn with_queues<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Make every subsequent acquisition fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Counters of queue `name`, if it was ever acquired.
    pub fn stats(&self, name: &str) -> Option<Arc<SoftStats>> {
        self.lock().get(name).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SoftStats>>> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl QueueProvider for SoftProvider {
    type Portal = SoftPortal;

    fn acquire(&self, name: &str, mode: WqMode) -> Result<SoftPortal> {
        let missing = self
            .known
            .as_ref()
            .is_some_and(|known| !known.iter().any(|k| k == name));
        if missing || self.unavailable.load(Ordering::Relaxed) {
            return Err(Error::QueueUnavailable {
                name: name.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        if mode != self.mode {
            return Err(Error::ModeMismatch {
                name: name.to_string(),
                expected: mode,
                found: self.mode.to_string(),
            });
        }
        let stats = self.lock().entry(name.to_string()).or_default().clone();
        Ok(SoftPortal::with_stats(name, self.config, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchParams;
    use crate::comp::CompStatus;
    use crate::desc::DescParams;
    use crate::dma::DmaAddr;

    fn addr<T>(p: *const T) -> DmaAddr {
        DmaAddr(p as u64)
    }

    fn memmove_desc(src: &[u8], dst: &mut [u8], rec: &mut CompletionRecord) -> HwDesc {
        let mut d = HwDesc::zeroed();
        d.prep(&DescParams {
            opcode: Opcode::MemMove,
            pasid: 1,
            src: addr(src.as_ptr()),
            dst: addr(dst.as_mut_ptr()),
            len: src.len() as u32,
            completion: addr(rec as *mut CompletionRecord),
            flags: DescFlags::RCR | DescFlags::CRAV,
        });
        d
    }

    #[test]
    fn test_memmove_copies_and_completes() {
        let portal = SoftPortal::new("wq0.0", SoftConfig::default());
        let src = [0xabu8; 256];
        let mut dst = [0u8; 256];
        let mut rec = CompletionRecord::default();
        let d = memmove_desc(&src, &mut dst, &mut rec);

        portal.write64(&d);
        assert_eq!(dst, src);
        assert_eq!(rec.status, StatusCode::Success as u8);
        assert_eq!(rec.bytes_completed, 256);
        assert_eq!(portal.stats().submitted(), 1);
        assert_eq!(portal.stats().executed(), 1);
    }

    #[test]
    fn test_null_destination_is_write_fault() {
        let portal = SoftPortal::new("wq0.0", SoftConfig::default());
        let src = [1u8; 64];
        let mut rec = CompletionRecord::default();
        let mut d = HwDesc::zeroed();
        d.prep(&DescParams {
            opcode: Opcode::MemMove,
            pasid: 1,
            src: addr(src.as_ptr()),
            dst: DmaAddr(0),
            len: 64,
            completion: addr(&mut rec as *mut CompletionRecord),
            flags: DescFlags::RCR | DescFlags::CRAV,
        });
        portal.write64(&d);
        let status = CompStatus::from_raw(rec.status).unwrap();
        assert_eq!(status.kind(), Some(StatusCode::PageFaultNoBof));
        assert!(status.is_write_fault());
        assert_eq!(portal.stats().faulted(), 1);
    }

    #[test]
    fn test_batch_runs_every_element() {
        let portal = SoftPortal::new("wq0.0", SoftConfig::default());
        let src = [7u8; 64];
        let mut dsts = [[0u8; 64]; 4];
        let mut recs = [CompletionRecord::default(); 4];
        let mut list = [HwDesc::zeroed(); 4];
        for i in 0..4 {
            list[i] = memmove_desc(&src, &mut dsts[i], &mut recs[i]);
        }
        let mut batch_rec = CompletionRecord::default();
        let mut batch = HwDesc::zeroed();
        batch.prep_batch(&BatchParams {
            pasid: 1,
            desc_list: addr(list.as_ptr()),
            count: 4,
            completion: addr(&mut batch_rec as *mut CompletionRecord),
            flags: DescFlags::RCR | DescFlags::CRAV,
        });

        assert_eq!(portal.enqueue(&batch), Enqueue::Accepted);
        assert_eq!(batch_rec.status, StatusCode::Success as u8);
        assert_eq!(batch_rec.bytes_completed, 4);
        assert!(recs.iter().all(|r| r.status == StatusCode::Success as u8));
        assert!(dsts.iter().all(|d| *d == src));
        assert_eq!(portal.stats().submitted(), 1);
        assert_eq!(portal.stats().executed(), 4);
    }

    #[test]
    fn test_batch_count_out_of_range() {
        let portal = SoftPortal::new(
            "wq0.0",
            SoftConfig {
                max_batch: 8,
                ..Default::default()
            },
        );
        let list = [HwDesc::zeroed(); 16];
        for count in [1u32, 9] {
            let mut rec = CompletionRecord::default();
            let mut batch = HwDesc::zeroed();
            batch.prep_batch(&BatchParams {
                pasid: 1,
                desc_list: addr(list.as_ptr()),
                count,
                completion: addr(&mut rec as *mut CompletionRecord),
                flags: DescFlags::RCR | DescFlags::CRAV,
            });
            portal.write64(&batch);
            assert_eq!(rec.status, StatusCode::DescCntErange as u8);
        }
        assert_eq!(portal.stats().executed(), 0);
    }

    #[test]
    fn test_busy_every_rejects_periodically() {
        let portal = SoftPortal::new(
            "wq0.0",
            SoftConfig {
                busy_every: 3,
                ..Default::default()
            },
        );
        let d = HwDesc::zeroed();
        let results: Vec<_> = (0..6).map(|_| portal.enqueue(&d)).collect();
        assert_eq!(results[2], Enqueue::Retry);
        assert_eq!(results[5], Enqueue::Retry);
        assert_eq!(portal.stats().rejected(), 2);
        assert_eq!(portal.stats().submitted(), 4);
    }

    #[test]
    fn test_provider_checks_mode_and_names() {
        let provider = SoftProvider::new(WqMode::Shared).with_queues(["wq0.0"]);
        assert!(provider.acquire("wq0.0", WqMode::Shared).is_ok());
        assert!(matches!(
            provider.acquire("wq0.0", WqMode::Dedicated),
            Err(Error::ModeMismatch { .. })
        ));
        assert!(matches!(
            provider.acquire("wq0.1", WqMode::Shared),
            Err(Error::QueueUnavailable { .. })
        ));
        assert!(provider.stats("wq0.0").is_some());
        assert!(provider.stats("wq0.1").is_none());
    }
}
