//! Completion record pool.
//!
//! A cache of fixed-size completion records shared by every worker. Records
//! are carved out of cache-line aligned chunks and recycled through a free
//! list, so concurrent alloc/free from many threads only contends on one
//! short critical section.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::comp::{CompAllocator, CompletionRecord};
use crate::error::{Error, Result};

/// Records are padded to a full cache line.
#[repr(C, align(64))]
struct PaddedRecord(CompletionRecord);

/// Records allocated per chunk.
pub const CHUNK_RECORDS: usize = 64;

struct PoolInner {
    free: Vec<NonNull<CompletionRecord>>,
    chunks: Vec<NonNull<PaddedRecord>>,
}

/// Thread-safe completion record allocator.
pub struct CompletionPool {
    inner: Mutex<PoolInner>,
    outstanding: AtomicUsize,
    chunk_layout: Layout,
}

unsafe impl Send for CompletionPool {}
unsafe impl Sync for CompletionPool {}

impl Default for CompletionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                chunks: Vec::new(),
            }),
            outstanding: AtomicUsize::new(0),
            chunk_layout: Layout::new::<[PaddedRecord; CHUNK_RECORDS]>(),
        }
    }

    /// Pre-populate the pool so at least `records` are free.
    pub fn reserve(&self, records: usize) -> Result<()> {
        let mut inner = self.lock();
        while inner.free.len() < records {
            self.grow(&mut inner)?;
        }
        Ok(())
    }

    /// Records currently handed out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Total records owned by the pool.
    pub fn capacity(&self) -> usize {
        self.lock().chunks.len() * CHUNK_RECORDS
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        // The free list is never left half-updated; a poisoned lock is
        // still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn grow(&self, inner: &mut PoolInner) -> Result<()> {
        let ptr = unsafe { std::alloc::alloc_zeroed(self.chunk_layout) } as *mut PaddedRecord;
        let chunk = NonNull::new(ptr).ok_or(Error::OutOfMemory {
            size: self.chunk_layout.size(),
        })?;
        inner.chunks.push(chunk);
        // Hand records out in address order.
        for i in (0..CHUNK_RECORDS).rev() {
            let rec = unsafe { chunk.as_ptr().add(i) } as *mut CompletionRecord;
            // SAFETY: derived from a non-null chunk pointer.
            inner.free.push(unsafe { NonNull::new_unchecked(rec) });
        }
        tracing::debug!(chunks = inner.chunks.len(), "completion pool grew");
        Ok(())
    }
}

impl CompAllocator for CompletionPool {
    fn alloc(&self) -> Result<NonNull<CompletionRecord>> {
        let rec = {
            let mut inner = self.lock();
            if inner.free.is_empty() {
                self.grow(&mut inner)?;
            }
            match inner.free.pop() {
                Some(rec) => rec,
                None => {
                    return Err(Error::OutOfMemory {
                        size: std::mem::size_of::<PaddedRecord>(),
                    });
                }
            }
        };
        unsafe { rec.as_ptr().write(CompletionRecord::default()) };
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Ok(rec)
    }

    unsafe fn free(&self, rec: NonNull<CompletionRecord>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        self.lock().free.push(rec);
    }
}

impl Drop for CompletionPool {
    fn drop(&mut self) {
        let outstanding = self.outstanding();
        if outstanding != 0 {
            tracing::warn!(outstanding, "completion pool destroyed with records in use");
        }
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        for chunk in inner.chunks.drain(..) {
            unsafe { std::alloc::dealloc(chunk.as_ptr() as *mut u8, self.chunk_layout) };
        }
    }
}
