//! Completion records and the completion poller.
//!
//! A completion record is written by the device once a descriptor (or a
//! whole batch) has been processed. Its first byte is the status: zero means
//! "not processed yet". Software zeroes the record before submission and
//! resets the status before reusing the record.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::Result;

/// Completion record size in bytes.
pub const COMP_SIZE: usize = 32;

/// Status field mask; bit 7 reports the fault direction.
pub const STATUS_MASK: u8 = 0x7f;

/// Set in a faulting status when the fault happened on a write.
pub const STATUS_WRITE_FAULT: u8 = 0x80;

/// Default spin cap of the bounded poller.
pub const DEFAULT_POLL_LIMIT: u32 = 200_000;

/// Hardware completion record.
///
/// Layout:
/// - offset 0: status
/// - offset 1: result
/// - offset 2: reserved
/// - offset 4: bytes completed
/// - offset 8: fault address
/// - offset 16: operation specific
#[repr(C, align(32))]
#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionRecord {
    pub status: u8,
    pub result: u8,
    pub rsvd: u16,
    pub bytes_completed: u32,
    pub fault_addr: u64,
    pub op_specific: [u8; 16],
}

const _: () = assert!(std::mem::size_of::<CompletionRecord>() == COMP_SIZE);

/// Known completion status codes (low 7 bits of the status byte).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    None = 0x00,
    Success = 0x01,
    SuccessPred = 0x02,
    PageFaultNoBof = 0x03,
    PageFaultIr = 0x04,
    BatchFail = 0x05,
    BatchPageFault = 0x06,
    DrOffsetNoInc = 0x07,
    DrOffsetErange = 0x08,
    DifErr = 0x09,
    BadOpcode = 0x10,
    InvalidFlags = 0x11,
    NonZeroReserve = 0x12,
    XferErange = 0x13,
    DescCntErange = 0x14,
    DrErange = 0x15,
    OverlapBuffers = 0x16,
    DcastErr = 0x17,
    DescListAlign = 0x18,
    IntHandleInval = 0x19,
    CraXlat = 0x1a,
    CraAlign = 0x1b,
    AddrAlign = 0x1c,
    PrivBad = 0x1d,
    TrafficClassConf = 0x1e,
    PfaultRdba = 0x1f,
    HwErr1 = 0x20,
    HwErrDrb = 0x21,
    TranslationFail = 0x22,
}

impl StatusCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::None,
            0x01 => Self::Success,
            0x02 => Self::SuccessPred,
            0x03 => Self::PageFaultNoBof,
            0x04 => Self::PageFaultIr,
            0x05 => Self::BatchFail,
            0x06 => Self::BatchPageFault,
            0x07 => Self::DrOffsetNoInc,
            0x08 => Self::DrOffsetErange,
            0x09 => Self::DifErr,
            0x10 => Self::BadOpcode,
            0x11 => Self::InvalidFlags,
            0x12 => Self::NonZeroReserve,
            0x13 => Self::XferErange,
            0x14 => Self::DescCntErange,
            0x15 => Self::DrErange,
            0x16 => Self::OverlapBuffers,
            0x17 => Self::DcastErr,
            0x18 => Self::DescListAlign,
            0x19 => Self::IntHandleInval,
            0x1a => Self::CraXlat,
            0x1b => Self::CraAlign,
            0x1c => Self::AddrAlign,
            0x1d => Self::PrivBad,
            0x1e => Self::TrafficClassConf,
            0x1f => Self::PfaultRdba,
            0x20 => Self::HwErr1,
            0x21 => Self::HwErrDrb,
            0x22 => Self::TranslationFail,
            _ => return None,
        })
    }
}

/// Decoded, non-pending completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompStatus(u8);

impl CompStatus {
    /// Decode a raw status byte. Returns `None` for zero (pending).
    pub fn from_raw(raw: u8) -> Option<Self> {
        if raw & STATUS_MASK == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Status code with the fault-direction bit stripped.
    pub fn code(&self) -> u8 {
        self.0 & STATUS_MASK
    }

    pub fn raw(&self) -> u8 {
        self.0
    }

    pub fn kind(&self) -> Option<StatusCode> {
        StatusCode::from_u8(self.code())
    }

    pub fn is_success(&self) -> bool {
        self.code() == StatusCode::Success as u8
    }

    pub fn is_write_fault(&self) -> bool {
        self.0 & STATUS_WRITE_FAULT != 0
    }
}

impl std::fmt::Display for CompStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind() {
            Some(k) => write!(f, "{:?} ({:#04x})", k, self.0),
            None => write!(f, "unknown ({:#04x})", self.0),
        }
    }
}

/// Busy-wait policy of the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPolicy {
    /// Give up after this many spin iterations.
    Bounded(u32),
    /// Spin until the device posts a status.
    Unbounded,
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy::Bounded(DEFAULT_POLL_LIMIT)
    }
}

/// Outcome of polling one completion record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// The spin cap was reached with the status still zero. The operation
    /// is still outstanding.
    Pending,
    /// The device posted a status.
    Ready(CompStatus),
}

impl Poll {
    pub fn is_pending(&self) -> bool {
        matches!(self, Poll::Pending)
    }
}

#[inline(always)]
unsafe fn read_status(rec: *const CompletionRecord) -> u8 {
    unsafe { std::ptr::read_volatile(std::ptr::addr_of!((*rec).status)) }
}

/// Spin on `rec`'s status byte according to `policy`.
///
/// # Safety
/// `rec` must point to a live completion record.
#[inline]
pub unsafe fn poll_record(rec: *const CompletionRecord, policy: PollPolicy) -> Poll {
    unsafe { poll_record_with(rec, policy, std::hint::spin_loop) }
}

/// [`poll_record`] with a caller-supplied relax step, run once per spin.
#[inline]
pub(crate) unsafe fn poll_record_with(
    rec: *const CompletionRecord,
    policy: PollPolicy,
    mut relax: impl FnMut(),
) -> Poll {
    let mut spins: u32 = 0;
    loop {
        let raw = unsafe { read_status(rec) };
        if let Some(status) = CompStatus::from_raw(raw) {
            dma_from_device_barrier!();
            return Poll::Ready(status);
        }
        if let PollPolicy::Bounded(limit) = policy {
            if spins >= limit {
                return Poll::Pending;
            }
            spins += 1;
        }
        relax();
    }
}

// =============================================================================
// Completion allocator
// =============================================================================

/// Thread-safe allocator of completion records.
pub trait CompAllocator: Send + Sync {
    /// Allocate a zeroed completion record.
    fn alloc(&self) -> Result<NonNull<CompletionRecord>>;

    /// Return a record to the allocator.
    ///
    /// # Safety
    /// `rec` must come from `alloc` on this allocator and must not be
    /// referenced by an in-flight operation.
    unsafe fn free(&self, rec: NonNull<CompletionRecord>);
}

/// An owned completion record. Returned to its allocator on drop.
pub struct CompSlot {
    rec: NonNull<CompletionRecord>,
    allocator: Arc<dyn CompAllocator>,
}

unsafe impl Send for CompSlot {}

impl CompSlot {
    pub fn new(allocator: Arc<dyn CompAllocator>) -> Result<Self> {
        let rec = allocator.alloc()?;
        Ok(Self { rec, allocator })
    }

    pub fn as_ptr(&self) -> NonNull<CompletionRecord> {
        self.rec
    }

    /// Raw status byte.
    #[inline]
    pub fn status(&self) -> u8 {
        unsafe { read_status(self.rec.as_ptr()) }
    }

    #[inline]
    pub fn poll(&self, policy: PollPolicy) -> Poll {
        unsafe { poll_record(self.rec.as_ptr(), policy) }
    }

    /// Fault address reported with a faulting status.
    pub fn fault_addr(&self) -> u64 {
        unsafe { std::ptr::read_volatile(std::ptr::addr_of!((*self.rec.as_ptr()).fault_addr)) }
    }

    pub fn bytes_completed(&self) -> u32 {
        unsafe {
            std::ptr::read_volatile(std::ptr::addr_of!((*self.rec.as_ptr()).bytes_completed))
        }
    }

    /// Reset the status so the record can be reused.
    #[inline]
    pub fn reset(&self) {
        unsafe { std::ptr::write_volatile(std::ptr::addr_of_mut!((*self.rec.as_ptr()).status), 0) }
    }
}

impl Drop for CompSlot {
    fn drop(&mut self) {
        unsafe { self.allocator.free(self.rec) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_status() {
        assert_eq!(CompStatus::from_raw(0), None);
        let ok = CompStatus::from_raw(1).unwrap();
        assert!(ok.is_success());
        assert_eq!(ok.kind(), Some(StatusCode::Success));

        let fault = CompStatus::from_raw(0x83).unwrap();
        assert!(!fault.is_success());
        assert!(fault.is_write_fault());
        assert_eq!(fault.kind(), Some(StatusCode::PageFaultNoBof));

        let unknown = CompStatus::from_raw(0x3f).unwrap();
        assert_eq!(unknown.kind(), None);
        assert_eq!(unknown.code(), 0x3f);
    }

    #[test]
    fn test_bare_write_bit_is_pending() {
        assert_eq!(CompStatus::from_raw(STATUS_WRITE_FAULT), None);
    }

    #[test]
    fn test_bounded_poll_spins_exactly_limit() {
        let rec = CompletionRecord::default();
        let mut spins = 0u32;
        let res = unsafe { poll_record_with(&rec, PollPolicy::Bounded(1000), || spins += 1) };
        assert_eq!(res, Poll::Pending);
        assert_eq!(spins, 1000);
    }

    #[test]
    fn test_bounded_poll_zero_limit() {
        let rec = CompletionRecord::default();
        let mut spins = 0u32;
        let res = unsafe { poll_record_with(&rec, PollPolicy::Bounded(0), || spins += 1) };
        assert!(res.is_pending());
        assert_eq!(spins, 0);
    }

    #[test]
    fn test_poll_ready_without_spinning() {
        let rec = CompletionRecord {
            status: 1,
            ..Default::default()
        };
        let mut spins = 0u32;
        let res = unsafe { poll_record_with(&rec, PollPolicy::Unbounded, || spins += 1) };
        assert_eq!(res, Poll::Ready(CompStatus::from_raw(1).unwrap()));
        assert_eq!(spins, 0);
    }

    #[test]
    fn test_unbounded_poll_observes_late_write() {
        let mut rec = CompletionRecord::default();
        let ptr: *mut CompletionRecord = &mut rec;
        let mut spins = 0u32;
        // Emulate the device posting a fault after a few spins.
        let res = unsafe {
            poll_record_with(ptr, PollPolicy::Unbounded, || {
                spins += 1;
                if spins == 50 {
                    std::ptr::write_volatile(std::ptr::addr_of_mut!((*ptr).status), 0x10);
                }
            })
        };
        assert_eq!(spins, 50);
        match res {
            Poll::Ready(s) => assert_eq!(s.kind(), Some(StatusCode::BadOpcode)),
            Poll::Pending => panic!("unbounded poll returned pending"),
        }
    }
}
