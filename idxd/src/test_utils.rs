//! Test doubles for the queue, memory and mapping collaborators.
//!
//! Enable the `test-utils` feature to use these from other crates.
//!
//! Every tracking wrapper reports to a shared [`Ledger`], which keeps the
//! acquire/release history of all resources in the order it happened and can
//! inject a failure at the n-th acquisition attempt.

use std::alloc::Layout;
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::comp::{CompAllocator, CompletionRecord, StatusCode};
use crate::desc::{DescFlags, HwDesc};
use crate::dma::{DmaAddr, DmaDirection, DmaMapper, HostAllocator, SystemAllocator};
use crate::error::{Error, Result};
use crate::wq::{Enqueue, Portal};

/// Kind of tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    HostBuffer,
    Mapping,
    ResourceMapping,
    Completion,
}

/// One tracked resource instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    pub kind: Resource,
    pub key: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Acquired(Token),
    Released(Token),
}

/// Shared acquire/release log with failure injection.
#[derive(Debug, Default)]
pub struct Ledger {
    events: Mutex<Vec<Event>>,
    attempts: AtomicUsize,
    fail_at: Option<usize>,
}

impl Ledger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the acquisition attempt with zero-based index `n`.
    pub fn failing_at(n: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_at: Some(n),
            ..Default::default()
        })
    }

    fn attempt(&self, kind: Resource) -> Result<()> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_at == Some(n) {
            return Err(match kind {
                Resource::HostBuffer | Resource::Completion => Error::OutOfMemory { size: 0 },
                Resource::Mapping | Resource::ResourceMapping => Error::MapFailed { len: 0 },
            });
        }
        Ok(())
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn acquired(&self) -> Vec<Token> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Acquired(t) => Some(t),
                Event::Released(_) => None,
            })
            .collect()
    }

    pub fn released(&self) -> Vec<Token> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Released(t) => Some(t),
                Event::Acquired(_) => None,
            })
            .collect()
    }

    /// Resources acquired and not yet released.
    pub fn live(&self) -> usize {
        self.acquired().len() - self.released().len()
    }

    pub fn count(&self, kind: Resource) -> usize {
        self.acquired().iter().filter(|t| t.kind == kind).count()
    }

    /// Whether every resource was released, in exact reverse acquisition
    /// order.
    pub fn released_in_reverse(&self) -> bool {
        let mut acquired = self.acquired();
        acquired.reverse();
        acquired == self.released()
    }
}

/// [`HostAllocator`] that logs to a [`Ledger`].
pub struct TrackingAllocator {
    inner: SystemAllocator,
    ledger: Arc<Ledger>,
}

impl TrackingAllocator {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            inner: SystemAllocator,
            ledger,
        }
    }
}

impl HostAllocator for TrackingAllocator {
    fn alloc(&self, layout: Layout) -> Result<NonNull<u8>> {
        self.ledger.attempt(Resource::HostBuffer)?;
        let ptr = self.inner.alloc(layout)?;
        self.ledger.push(Event::Acquired(Token {
            kind: Resource::HostBuffer,
            key: ptr.as_ptr() as u64,
        }));
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        self.ledger.push(Event::Released(Token {
            kind: Resource::HostBuffer,
            key: ptr.as_ptr() as u64,
        }));
        unsafe { self.inner.free(ptr, layout) };
    }
}

/// [`DmaMapper`] that logs to a [`Ledger`].
pub struct TrackingMapper<M> {
    inner: M,
    ledger: Arc<Ledger>,
}

impl<M: DmaMapper> TrackingMapper<M> {
    pub fn new(inner: M, ledger: Arc<Ledger>) -> Self {
        Self { inner, ledger }
    }
}

impl<M: DmaMapper> DmaMapper for TrackingMapper<M> {
    fn map_single(&self, host: NonNull<u8>, len: usize, dir: DmaDirection) -> Result<DmaAddr> {
        self.ledger.attempt(Resource::Mapping)?;
        let addr = self.inner.map_single(host, len, dir)?;
        self.ledger.push(Event::Acquired(Token {
            kind: Resource::Mapping,
            key: addr.0,
        }));
        Ok(addr)
    }

    fn map_resource(&self, phys: u64, len: usize, dir: DmaDirection) -> Result<DmaAddr> {
        self.ledger.attempt(Resource::ResourceMapping)?;
        let addr = self.inner.map_resource(phys, len, dir)?;
        self.ledger.push(Event::Acquired(Token {
            kind: Resource::ResourceMapping,
            key: addr.0,
        }));
        Ok(addr)
    }

    fn unmap_single(&self, addr: DmaAddr, len: usize, dir: DmaDirection) {
        self.ledger.push(Event::Released(Token {
            kind: Resource::Mapping,
            key: addr.0,
        }));
        self.inner.unmap_single(addr, len, dir);
    }

    fn unmap_resource(&self, addr: DmaAddr, len: usize, dir: DmaDirection) {
        self.ledger.push(Event::Released(Token {
            kind: Resource::ResourceMapping,
            key: addr.0,
        }));
        self.inner.unmap_resource(addr, len, dir);
    }
}

/// [`CompAllocator`] that logs to a [`Ledger`].
pub struct TrackingCompAllocator<A> {
    inner: A,
    ledger: Arc<Ledger>,
}

impl<A: CompAllocator> TrackingCompAllocator<A> {
    pub fn new(inner: A, ledger: Arc<Ledger>) -> Self {
        Self { inner, ledger }
    }
}

impl<A: CompAllocator> CompAllocator for TrackingCompAllocator<A> {
    fn alloc(&self) -> Result<NonNull<CompletionRecord>> {
        self.ledger.attempt(Resource::Completion)?;
        let rec = self.inner.alloc()?;
        self.ledger.push(Event::Acquired(Token {
            kind: Resource::Completion,
            key: rec.as_ptr() as u64,
        }));
        Ok(rec)
    }

    unsafe fn free(&self, rec: NonNull<CompletionRecord>) {
        self.ledger.push(Event::Released(Token {
            kind: Resource::Completion,
            key: rec.as_ptr() as u64,
        }));
        unsafe { self.inner.free(rec) };
    }
}

// =============================================================================
// Scripted portal
// =============================================================================

#[derive(Debug, Default)]
struct Script {
    responses: VecDeque<Enqueue>,
    submitted: Vec<HwDesc>,
    attempts: usize,
    violations: Vec<String>,
}

/// Portal whose enqueue answers follow a script.
///
/// Accepted descriptors are recorded and, unless the portal is silent,
/// completed immediately with the configured status (element records of a
/// batch included). A descriptor submitted while its completion record still
/// holds a status is recorded as a violation: the previous completion was
/// never consumed and reset.
pub struct ScriptedPortal {
    script: Mutex<Script>,
    status: Option<u8>,
}

impl Default for ScriptedPortal {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedPortal {
    /// Accepts everything and completes with success.
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::default()),
            status: Some(StatusCode::Success as u8),
        }
    }

    /// Answer the first enqueue attempts with `responses`, then accept.
    pub fn with_script(self, responses: impl IntoIterator<Item = Enqueue>) -> Self {
        self.script.lock().unwrap().responses = responses.into_iter().collect();
        self
    }

    /// Reject the first `n` enqueue attempts as queue full.
    pub fn with_rejects(self, n: usize) -> Self {
        self.with_script(std::iter::repeat_n(Enqueue::Retry, n))
    }

    /// Complete descriptors with `status` instead of success.
    pub fn with_status(mut self, status: u8) -> Self {
        self.status = Some(status);
        self
    }

    /// Never complete anything.
    pub fn silent(mut self) -> Self {
        self.status = None;
        self
    }

    /// Descriptors accepted so far.
    pub fn submitted(&self) -> Vec<HwDesc> {
        self.script.lock().unwrap().submitted.clone()
    }

    /// Enqueue attempts so far.
    pub fn attempts(&self) -> usize {
        self.script.lock().unwrap().attempts
    }

    /// Re-submissions of a record that was never consumed.
    pub fn violations(&self) -> Vec<String> {
        self.script.lock().unwrap().violations.clone()
    }

    fn accept(&self, script: &mut Script, desc: &HwDesc) {
        let mut targets = vec![*desc];
        if desc.is_batch() {
            let list = desc.desc_list_addr().0 as *const HwDesc;
            for i in 0..desc.desc_count() as usize {
                targets.push(unsafe { std::ptr::read_volatile(list.add(i)) });
            }
        }
        for d in &targets {
            let rec = d.completion_addr().0 as *mut CompletionRecord;
            if !d.flags().contains(DescFlags::RCR) || rec.is_null() {
                continue;
            }
            let status = unsafe { std::ptr::read_volatile(std::ptr::addr_of!((*rec).status)) };
            if status != 0 {
                script
                    .violations
                    .push(format!("record {:#x} resubmitted with status {:#x}", rec as u64, status));
            }
        }
        script.submitted.push(*desc);
        if let Some(status) = self.status {
            for d in targets.iter().rev() {
                let rec = d.completion_addr().0 as *mut CompletionRecord;
                if d.flags().contains(DescFlags::RCR) && !rec.is_null() {
                    unsafe { std::ptr::write_volatile(std::ptr::addr_of_mut!((*rec).status), status) };
                }
            }
        }
    }
}

impl Portal for ScriptedPortal {
    fn write64(&self, desc: &HwDesc) {
        let mut script = self.script.lock().unwrap();
        self.accept(&mut script, desc);
    }

    fn enqueue(&self, desc: &HwDesc) -> Enqueue {
        let mut script = self.script.lock().unwrap();
        script.attempts += 1;
        let response = script.responses.pop_front().unwrap_or(Enqueue::Accepted);
        if response == Enqueue::Accepted {
            self.accept(&mut script, desc);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comp::CompSlot;
    use crate::dma::{DmaMapping, HostBuffer, SvaMapper};
    use crate::pool::CompletionPool;

    #[test]
    fn test_ledger_reverse_release() {
        let ledger = Ledger::new();
        let alloc: Arc<dyn HostAllocator> = Arc::new(TrackingAllocator::new(ledger.clone()));
        let mapper: Arc<dyn DmaMapper> =
            Arc::new(TrackingMapper::new(SvaMapper::new(), ledger.clone()));
        let comps: Arc<dyn CompAllocator> = Arc::new(TrackingCompAllocator::new(
            CompletionPool::new(),
            ledger.clone(),
        ));
        {
            let buf = HostBuffer::new(alloc, 128).unwrap();
            let _map = DmaMapping::single(mapper, buf.as_ptr(), 128, DmaDirection::Bidirectional)
                .unwrap();
            let _slot = CompSlot::new(comps).unwrap();
            assert_eq!(ledger.live(), 3);
        }
        assert_eq!(ledger.live(), 0);
        assert!(ledger.released_in_reverse());
    }

    #[test]
    fn test_ledger_injects_failure() {
        let ledger = Ledger::failing_at(1);
        let alloc: Arc<dyn HostAllocator> = Arc::new(TrackingAllocator::new(ledger.clone()));
        let first = HostBuffer::new(alloc.clone(), 64).unwrap();
        assert!(matches!(
            HostBuffer::new(alloc.clone(), 64),
            Err(Error::OutOfMemory { .. })
        ));
        let third = HostBuffer::new(alloc, 64).unwrap();
        assert_eq!(ledger.count(Resource::HostBuffer), 2);
        drop(third);
        drop(first);
        assert!(ledger.released_in_reverse());
    }

    #[test]
    fn test_scripted_portal_detects_unconsumed_record() {
        let portal = ScriptedPortal::new().with_rejects(2);
        let mut rec = CompletionRecord::default();
        let mut d = HwDesc::zeroed();
        d.prep(&crate::desc::DescParams {
            opcode: crate::desc::Opcode::Noop,
            pasid: 0,
            src: DmaAddr(0),
            dst: DmaAddr(0),
            len: 0,
            completion: DmaAddr(&mut rec as *mut CompletionRecord as u64),
            flags: DescFlags::RCR | DescFlags::CRAV,
        });
        assert_eq!(portal.enqueue(&d), Enqueue::Retry);
        assert_eq!(portal.enqueue(&d), Enqueue::Retry);
        assert_eq!(portal.enqueue(&d), Enqueue::Accepted);
        assert!(portal.violations().is_empty());
        // Status was never reset.
        portal.write64(&d);
        assert_eq!(portal.violations().len(), 1);
        assert_eq!(portal.attempts(), 3);
        assert_eq!(portal.submitted().len(), 2);
    }
}
