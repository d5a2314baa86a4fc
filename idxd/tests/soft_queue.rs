//! Submission and completion through emulated and real work queues.

use std::sync::Arc;

use idxd::{
    BatchParams, CompAllocator, CompSlot, CompletionPool, DescFlags, DescParams, DmaAddr,
    DmaDirection, DmaMapper, DmaMapping, HostBuffer, HwDesc, Opcode, Poll, PollPolicy,
    QueueProvider, Shared, SoftConfig, SoftPortal, SoftProvider, StatusCode, SubmitError,
    SvaMapper, SysfsProvider, SystemAllocator, WorkQueue, WqMode, DEFAULT_ENQ_RETRIES,
};

const BLOCK: usize = 512;
const K: usize = 16;

/// Skip the test if no shared user work queue is available.
macro_rules! require_queue {
    ($name:expr) => {{
        match SysfsProvider::new().acquire($name, WqMode::Shared) {
            Ok(portal) => portal,
            Err(e) => {
                eprintln!("Skipping test: {}", e);
                return;
            }
        }
    }};
}

struct Fixture {
    src: HostBuffer,
    dst: HostBuffer,
    mapper: Arc<dyn DmaMapper>,
    comps: Arc<dyn CompAllocator>,
}

impl Fixture {
    fn new() -> Self {
        let mut src = HostBuffer::new(Arc::new(SystemAllocator), K * BLOCK).unwrap();
        for (i, b) in src.as_mut_slice().iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let dst = HostBuffer::new(Arc::new(SystemAllocator), K * BLOCK).unwrap();
        Self {
            src,
            dst,
            mapper: Arc::new(SvaMapper::new()),
            comps: Arc::new(CompletionPool::new()),
        }
    }

    fn map(&self, buf: &HostBuffer) -> DmaMapping {
        DmaMapping::single(
            self.mapper.clone(),
            buf.as_ptr(),
            buf.len(),
            DmaDirection::Bidirectional,
        )
        .unwrap()
    }

    fn prep(&self, descs: &mut [HwDesc], slots: &[CompSlot], src: DmaAddr, dst: DmaAddr) {
        for (i, (d, slot)) in descs.iter_mut().zip(slots).enumerate() {
            d.prep(&DescParams {
                opcode: Opcode::MemMove,
                pasid: 1,
                src: DmaAddr(src.0 + (i * BLOCK) as u64),
                dst: DmaAddr(dst.0 + (i * BLOCK) as u64),
                len: BLOCK as u32,
                completion: DmaAddr(slot.as_ptr().as_ptr() as u64),
                flags: DescFlags::RCR | DescFlags::CRAV,
            });
        }
    }
}

fn soft_queue(config: SoftConfig) -> WorkQueue<SoftPortal, Shared> {
    WorkQueue::new("wq0.0", SoftPortal::new("wq0.0", config), DEFAULT_ENQ_RETRIES)
}

fn individual(wq: &WorkQueue<SoftPortal, Shared>, f: &Fixture) -> u64 {
    let src = f.map(&f.src);
    let dst = f.map(&f.dst);
    let slots: Vec<_> = (0..K).map(|_| CompSlot::new(f.comps.clone()).unwrap()).collect();
    let mut descs = vec![HwDesc::zeroed(); K];
    f.prep(&mut descs, &slots, src.addr(), dst.addr());

    for d in &descs {
        wq.submit(d).unwrap();
    }
    let mut completed = 0;
    for slot in &slots {
        match slot.poll(PollPolicy::default()) {
            Poll::Ready(s) if s.is_success() => completed += 1,
            other => panic!("unexpected completion {:?}", other),
        }
        slot.reset();
    }
    completed
}

fn batched(wq: &WorkQueue<SoftPortal, Shared>, f: &Fixture) -> u64 {
    let src = f.map(&f.src);
    let dst = f.map(&f.dst);
    let slots: Vec<_> = (0..K).map(|_| CompSlot::new(f.comps.clone()).unwrap()).collect();
    let batch_slot = CompSlot::new(f.comps.clone()).unwrap();
    let mut descs = vec![HwDesc::zeroed(); K];
    f.prep(&mut descs, &slots, src.addr(), dst.addr());
    let list = DmaMapping::single(
        f.mapper.clone(),
        std::ptr::NonNull::new(descs.as_mut_ptr() as *mut u8).unwrap(),
        K * std::mem::size_of::<HwDesc>(),
        DmaDirection::ToDevice,
    )
    .unwrap();

    let mut batch = HwDesc::zeroed();
    batch.prep_batch(&BatchParams {
        pasid: 1,
        desc_list: list.addr(),
        count: K as u32,
        completion: DmaAddr(batch_slot.as_ptr().as_ptr() as u64),
        flags: DescFlags::RCR | DescFlags::CRAV,
    });
    wq.submit(&batch).unwrap();

    let completed = match batch_slot.poll(PollPolicy::default()) {
        Poll::Ready(s) if s.is_success() => K as u64,
        other => panic!("unexpected batch completion {:?}", other),
    };
    batch_slot.reset();
    for slot in &slots {
        slot.reset();
    }
    completed
}

#[test]
fn test_batch_equivalence() {
    let f = Fixture::new();

    let wq = soft_queue(SoftConfig::default());
    let one_by_one = individual(&wq, &f);
    assert_eq!(f.dst.as_slice(), f.src.as_slice());

    let f = Fixture::new();
    let wq = soft_queue(SoftConfig::default());
    let as_batch = batched(&wq, &f);
    assert_eq!(f.dst.as_slice(), f.src.as_slice());

    assert_eq!(one_by_one, as_batch);
    assert_eq!(wq.portal().stats().submitted(), 1);
    assert_eq!(wq.portal().stats().executed(), K as u64);
}

#[test]
fn test_busy_queue_retries_transparently() {
    let f = Fixture::new();
    let wq = soft_queue(SoftConfig {
        busy_every: 2,
        ..Default::default()
    });
    assert_eq!(individual(&wq, &f), K as u64);
    // Every second attempt is rejected; each rejection costs one retry.
    assert_eq!(wq.portal().stats().rejected(), K as u64 - 1);
    assert_eq!(wq.portal().stats().submitted(), K as u64);
}

#[test]
fn test_stalled_queue_times_out() {
    let f = Fixture::new();
    let wq = soft_queue(SoftConfig {
        stall: true,
        ..Default::default()
    });
    let slot = CompSlot::new(f.comps.clone()).unwrap();
    let mut descs = [HwDesc::zeroed()];
    let src = f.map(&f.src);
    let dst = f.map(&f.dst);
    f.prep(&mut descs, std::slice::from_ref(&slot), src.addr(), dst.addr());

    wq.submit(&descs[0]).unwrap();
    assert_eq!(slot.poll(PollPolicy::Bounded(1000)), Poll::Pending);
    assert_eq!(slot.status(), 0);
}

#[test]
fn test_zero_budget_reports_busy() {
    let wq: WorkQueue<_, Shared> = WorkQueue::new(
        "wq0.0",
        SoftPortal::new(
            "wq0.0",
            SoftConfig {
                busy_every: 1,
                ..Default::default()
            },
        ),
        0,
    );
    let err = wq.submit(&HwDesc::zeroed()).unwrap_err();
    assert_eq!(err, SubmitError::Busy);
    assert_eq!(wq.portal().stats().rejected(), 1);
}

#[test]
fn test_provider_counters_outlive_portal() {
    let provider = SoftProvider::new(WqMode::Shared);
    {
        let portal = provider.acquire("wq0.3", WqMode::Shared).unwrap();
        let wq: WorkQueue<_, Shared> = WorkQueue::new("wq0.3", portal, 4);
        wq.submit(&HwDesc::zeroed()).unwrap();
    }
    assert_eq!(provider.stats("wq0.3").unwrap().submitted(), 1);
}

#[test]
fn test_bad_opcode_reported() {
    let f = Fixture::new();
    let wq = soft_queue(SoftConfig::default());
    let slot = CompSlot::new(f.comps.clone()).unwrap();
    let mut d = HwDesc::zeroed();
    d.prep(&DescParams {
        opcode: Opcode::Compare,
        pasid: 1,
        src: DmaAddr(f.src.as_ptr().as_ptr() as u64),
        dst: DmaAddr(f.dst.as_ptr().as_ptr() as u64),
        len: BLOCK as u32,
        completion: DmaAddr(slot.as_ptr().as_ptr() as u64),
        flags: DescFlags::RCR | DescFlags::CRAV,
    });
    wq.submit(&d).unwrap();
    match slot.poll(PollPolicy::Unbounded) {
        Poll::Ready(s) => assert_eq!(s.kind(), Some(StatusCode::BadOpcode)),
        Poll::Pending => panic!("unbounded poll returned pending"),
    }
}

#[test]
fn test_hw_memmove() {
    let portal = require_queue!("wq0.0");
    let wq: WorkQueue<_, Shared> = WorkQueue::new("wq0.0", portal, DEFAULT_ENQ_RETRIES);
    let f = Fixture::new();
    let slot = CompSlot::new(f.comps.clone()).unwrap();
    let mut descs = [HwDesc::zeroed()];
    let src = f.map(&f.src);
    let dst = f.map(&f.dst);
    f.prep(&mut descs, std::slice::from_ref(&slot), src.addr(), dst.addr());

    let mut submitted = false;
    for _ in 0..100 {
        match wq.submit(&descs[0]) {
            Ok(()) => {
                submitted = true;
                break;
            }
            Err(e) if e.is_transient() => continue,
            Err(e) => panic!("submit failed: {}", e),
        }
    }
    assert!(submitted);
    match slot.poll(PollPolicy::default()) {
        Poll::Ready(s) => assert!(s.is_success(), "completion {}", s),
        Poll::Pending => panic!("memmove did not complete"),
    }
    assert_eq!(&f.dst.as_slice()[..BLOCK], &f.src.as_slice()[..BLOCK]);
}
