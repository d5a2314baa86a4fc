//! # idxd - Work-queue primitives for Intel Data Streaming Accelerator
//!
//! This crate drives DSA work queues directly from user space: it builds
//! 64-byte work descriptors, hands them to a work-queue portal, and spins on
//! the device-written completion records.
//!
//! ## Submission
//!
//! A portal is a write-only MMIO page. The queue's configured mode decides
//! how a descriptor reaches it:
//!
//! - **Dedicated** queues take a single `MOVDIR64B` posted write.
//! - **Shared** queues take `ENQCMD`, which the device may reject while the
//!   queue is full. Rejections are retried within a per-queue budget and
//!   surface as [`SubmitError::Busy`], never as a fatal error.
//!
//! The mode is part of the queue's type:
//!
//! ```ignore
//! let portal = SysfsProvider::new().acquire("wq0.0", WqMode::Shared)?;
//! let wq: WorkQueue<_, Shared> = WorkQueue::new("wq0.0", portal, DEFAULT_ENQ_RETRIES);
//!
//! desc.prep(&DescParams { opcode: Opcode::MemMove, .. });
//! wq.submit(&desc)?;
//! match slot.poll(PollPolicy::Bounded(DEFAULT_POLL_LIMIT)) {
//!     Poll::Ready(status) if status.is_success() => slot.reset(),
//!     Poll::Ready(status) => { /* fault: status.code(), slot.fault_addr() */ }
//!     Poll::Pending => { /* still outstanding */ }
//! }
//! ```
//!
//! ## Resources
//!
//! Host memory, device-address mapping and completion records are obtained
//! from collaborators ([`HostAllocator`], [`DmaMapper`], [`CompAllocator`])
//! through guards that release on drop. Declaring the guards in acquisition
//! order releases them in reverse.
//!
//! ## Module Overview
//!
//! - [`desc`]: descriptor layout, opcodes and flags
//! - [`batch`]: batch descriptors
//! - [`comp`]: completion records and the poller
//! - [`wq`]: portals, submission modes and queue handles
//! - [`pool`]: thread-safe completion record pool
//! - [`dma`]: host buffers and device-address mappings
//! - [`device`]: user-space portals under `/dev/dsa`
//! - [`soft`]: software-emulated queues

#[macro_use]
mod barrier;

pub mod batch;
pub mod comp;
pub mod desc;
pub mod device;
pub mod dma;
pub mod error;
pub mod pool;
pub mod soft;
pub mod wq;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use batch::{BatchParams, MAX_BATCH_SIZE, MIN_BATCH_SIZE};
pub use comp::{
    CompAllocator, CompSlot, CompStatus, CompletionRecord, DEFAULT_POLL_LIMIT, Poll, PollPolicy,
    StatusCode,
};
pub use desc::{DescFlags, DescParams, HwDesc, Opcode};
pub use device::{SysfsProvider, UserPortal};
pub use dma::{
    DmaAddr, DmaDirection, DmaMapper, DmaMapping, HostAllocator, HostBuffer, ResourceWindow,
    SvaMapper, SystemAllocator,
};
pub use error::{Error, Result};
pub use pool::CompletionPool;
pub use soft::{SoftConfig, SoftPortal, SoftProvider};
pub use wq::{
    DEFAULT_ENQ_RETRIES, Dedicated, Enqueue, Portal, QueueProvider, Shared, SubmitError,
    SubmitMode, WorkQueue, WqMode,
};
