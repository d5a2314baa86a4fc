//! Per-worker resources and the submit/poll rounds.
//!
//! A [`WorkerContext`] owns everything one worker touches: its buffers, the
//! descriptor array, one completion record per descriptor plus one for the
//! batch, and the device mappings of all of them. Nothing in it is shared
//! with other workers except the queue handle.
//!
//! Resources are acquired in a fixed order and released in exactly the
//! reverse order, both on a normal teardown and when setup fails halfway.
//! Setup binds each guard to a local in acquisition order, so an early
//! return drops them in reverse; the struct declares its fields in reverse
//! acquisition order for the same effect on drop.

use std::ptr::NonNull;
use std::sync::Arc;

use idxd::comp::COMP_SIZE;
use idxd::{
    BatchParams, CompAllocator, CompSlot, CompStatus, DescFlags, DescParams, DmaAddr,
    DmaDirection, DmaMapper, DmaMapping, HostAllocator, HostBuffer, HwDesc, Opcode, Poll,
    PollPolicy, Portal, SubmitMode, WorkQueue,
};

use crate::config::{BenchConfig, Target, Workload};
use crate::error::Result;
use crate::worker::WorkerStats;

/// Flags of every descriptor the benchmark builds.
const OP_FLAGS: DescFlags = DescFlags::RCR.union(DescFlags::CRAV);

/// Collaborators shared by all workers.
pub struct Platform {
    pub host: Arc<dyn HostAllocator>,
    pub mapper: Arc<dyn DmaMapper>,
    pub comps: Arc<dyn CompAllocator>,
}

/// A `Vec` that drops its elements last-in first-out.
pub struct Lifo<T>(Vec<T>);

impl<T> Lifo<T> {
    pub fn with_capacity(n: usize) -> Self {
        Self(Vec::with_capacity(n))
    }

    pub fn push(&mut self, v: T) {
        self.0.push(v);
    }
}

impl<T> std::ops::Deref for Lifo<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.0
    }
}

impl<T> Drop for Lifo<T> {
    fn drop(&mut self) {
        while let Some(v) = self.0.pop() {
            drop(v);
        }
    }
}

/// How a round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Every submitted descriptor was retired.
    Done,
    /// A bounded poll gave up; work is still in flight.
    Stalled,
}

/// What happened to a context at the end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Every resource was released.
    Released,
    /// Operations were still in flight; the context was leaked so the
    /// device never writes into freed memory.
    Leaked(usize),
}

pub struct WorkerContext<P: Portal, M: SubmitMode> {
    // Reverse acquisition order.
    comp_maps: Lifo<DmaMapping>,
    comps: Lifo<CompSlot>,
    desc_map: DmaMapping,
    descs: Box<[HwDesc]>,
    remote_map: Option<DmaMapping>,
    dst_map: DmaMapping,
    src_map: DmaMapping,
    dst: HostBuffer,
    src: HostBuffer,
    queue: Arc<WorkQueue<P, M>>,

    batch: HwDesc,
    /// One flag per completion record; the last one is the batch record.
    inflight: Vec<bool>,
    id: usize,
    pasid: u32,
    block_size: u32,
    workload: Workload,
    poll: PollPolicy,
}

impl<P: Portal, M: SubmitMode> WorkerContext<P, M> {
    /// Acquire every per-worker resource.
    ///
    /// Order: queue reference, source buffer, destination buffer, source
    /// mapping, destination mapping, remote mapping, descriptor array
    /// mapping, completion records, completion record mappings.
    pub fn setup(
        id: usize,
        queue: Arc<WorkQueue<P, M>>,
        platform: &Platform,
        config: &BenchConfig,
    ) -> Result<Self> {
        let n = config.desc_count;
        let block = config.block_size;
        let dir = DmaDirection::Bidirectional;

        let mut src = HostBuffer::new(platform.host.clone(), block)?;
        src.fill(id as u8 ^ 0xa5);
        let dst = HostBuffer::new(platform.host.clone(), block)?;
        let src_map = DmaMapping::single(platform.mapper.clone(), src.as_ptr(), block, dir)?;
        let dst_map = DmaMapping::single(platform.mapper.clone(), dst.as_ptr(), block, dir)?;
        let remote_map = match config.target() {
            Target::Host => None,
            Target::Remote { phys } => Some(DmaMapping::resource(
                platform.mapper.clone(),
                phys + (id * block) as u64,
                block,
                dir,
            )?),
        };

        let mut descs = vec![HwDesc::zeroed(); n].into_boxed_slice();
        let list = NonNull::from(&mut *descs).cast::<u8>();
        let desc_map = DmaMapping::single(
            platform.mapper.clone(),
            list,
            n * std::mem::size_of::<HwDesc>(),
            dir,
        )?;

        let mut comps = Lifo::with_capacity(n + 1);
        for _ in 0..=n {
            comps.push(CompSlot::new(platform.comps.clone())?);
        }
        let mut comp_maps = Lifo::with_capacity(n + 1);
        for slot in comps.iter() {
            comp_maps.push(DmaMapping::single(
                platform.mapper.clone(),
                slot.as_ptr().cast::<u8>(),
                COMP_SIZE,
                dir,
            )?);
        }

        tracing::debug!(
            worker = id,
            queue = queue.name(),
            descriptors = n,
            block,
            "worker context ready"
        );
        Ok(Self {
            comp_maps,
            comps,
            desc_map,
            descs,
            remote_map,
            dst_map,
            src_map,
            dst,
            src,
            queue,
            batch: HwDesc::zeroed(),
            inflight: vec![false; n + 1],
            id,
            pasid: config.pasid,
            block_size: block as u32,
            workload: config.workload,
            poll: config.poll,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn queue(&self) -> &WorkQueue<P, M> {
        &self.queue
    }

    pub fn src(&self) -> &HostBuffer {
        &self.src
    }

    pub fn dst(&self) -> &HostBuffer {
        &self.dst
    }

    /// Device address the copies write to.
    pub fn dest_addr(&self) -> DmaAddr {
        match &self.remote_map {
            Some(m) => m.addr(),
            None => self.dst_map.addr(),
        }
    }

    /// Completion records with an operation in flight.
    pub fn outstanding(&self) -> usize {
        self.inflight.iter().filter(|&&f| f).count()
    }

    fn desc_count(&self) -> usize {
        self.descs.len()
    }

    fn prep(&mut self, i: usize) {
        debug_assert!(!self.inflight[i], "slot {} reused while in flight", i);
        let params = DescParams {
            opcode: Opcode::MemMove,
            pasid: self.pasid,
            src: self.src_map.addr(),
            dst: self.dest_addr(),
            len: self.block_size,
            completion: self.comp_maps[i].addr(),
            flags: OP_FLAGS,
        };
        self.descs[i].prep(&params);
    }

    fn log_fault(&self, op: &str, slot: usize, status: CompStatus) {
        let fault_addr = format!("{:#x}", self.comps[slot].fault_addr());
        tracing::error!(
            worker = self.id,
            op,
            slot,
            code = status.code(),
            status = %status,
            fault_addr = %fault_addr,
            "operation failed"
        );
    }

    /// Run one round of the configured workload.
    pub fn run_round(&mut self, stats: &mut WorkerStats) -> RoundOutcome {
        match self.workload {
            Workload::Individual => self.individual_round(stats),
            Workload::Batch => self.batch_round(stats),
        }
    }

    /// Submit descriptors in order until the queue pushes back, then retire
    /// exactly the submitted prefix in submission order.
    fn individual_round(&mut self, stats: &mut WorkerStats) -> RoundOutcome {
        let n = self.desc_count();
        let mut submitted = 0;
        let mut fatal = false;
        for i in 0..n {
            self.prep(i);
            match self.queue.submit(&self.descs[i]) {
                Ok(()) => {
                    self.inflight[i] = true;
                    submitted += 1;
                }
                Err(e) if e.is_transient() => {
                    stats.busy += 1;
                    tracing::debug!(worker = self.id, slot = i, "work queue busy");
                    break;
                }
                Err(e) => {
                    stats.fatal += 1;
                    fatal = true;
                    tracing::error!(
                        worker = self.id,
                        op = "memmove",
                        slot = i,
                        rc = e.code(),
                        "failed to submit descriptor"
                    );
                    break;
                }
            }
        }
        stats.submitted += submitted as u64;

        for i in 0..submitted {
            match self.comps[i].poll(self.poll) {
                Poll::Ready(status) => {
                    if status.is_success() {
                        stats.completed += 1;
                    } else {
                        stats.failed += 1;
                        self.log_fault("memmove", i, status);
                    }
                    self.comps[i].reset();
                    self.inflight[i] = false;
                }
                Poll::Pending => {
                    tracing::error!(
                        worker = self.id,
                        op = "memmove",
                        slot = i,
                        "completion poll timed out"
                    );
                    return RoundOutcome::Stalled;
                }
            }
        }
        if submitted > 0 || fatal {
            stats.rounds += 1;
        }
        RoundOutcome::Done
    }

    /// Wrap every descriptor in one batch, submit it and poll the batch
    /// record. Success completes all descriptors; failure fails all of them.
    fn batch_round(&mut self, stats: &mut WorkerStats) -> RoundOutcome {
        let n = self.desc_count();
        for i in 0..n {
            self.prep(i);
        }
        debug_assert!(!self.inflight[n]);
        self.batch.prep_batch(&BatchParams {
            pasid: self.pasid,
            desc_list: self.desc_map.addr(),
            count: n as u32,
            completion: self.comp_maps[n].addr(),
            flags: OP_FLAGS,
        });

        match self.queue.submit(&self.batch) {
            Ok(()) => {
                self.inflight.fill(true);
                stats.submitted += 1;
            }
            Err(e) if e.is_transient() => {
                stats.busy += 1;
                tracing::debug!(worker = self.id, "work queue busy");
                return RoundOutcome::Done;
            }
            Err(e) => {
                stats.fatal += 1;
                stats.rounds += 1;
                tracing::error!(
                    worker = self.id,
                    op = "batch",
                    rc = e.code(),
                    "failed to submit batch descriptor"
                );
                return RoundOutcome::Done;
            }
        }

        match self.comps[n].poll(self.poll) {
            Poll::Ready(status) => {
                if status.is_success() {
                    stats.completed += n as u64;
                } else {
                    stats.failed += n as u64;
                    self.log_fault("batch", n, status);
                }
                self.retire_batch();
                stats.rounds += 1;
                RoundOutcome::Done
            }
            Poll::Pending => {
                tracing::error!(worker = self.id, op = "batch", "completion poll timed out");
                RoundOutcome::Stalled
            }
        }
    }

    fn retire_batch(&mut self) {
        for slot in self.comps.iter() {
            slot.reset();
        }
        self.inflight.fill(false);
    }

    /// Give every in-flight operation one more poll. Returns how many are
    /// still outstanding.
    pub fn drain(&mut self, stats: &mut WorkerStats) -> usize {
        let n = self.desc_count();
        if self.inflight[n] {
            if let Poll::Ready(status) = self.comps[n].poll(self.poll) {
                if !status.is_success() {
                    self.log_fault("batch", n, status);
                }
                stats.drained += n as u64;
                self.retire_batch();
            }
            return self.outstanding();
        }
        for i in 0..n {
            if !self.inflight[i] {
                continue;
            }
            if let Poll::Ready(status) = self.comps[i].poll(self.poll) {
                if !status.is_success() {
                    self.log_fault("memmove", i, status);
                }
                stats.drained += 1;
                self.comps[i].reset();
                self.inflight[i] = false;
            }
        }
        self.outstanding()
    }

    /// Drain, then release everything, or leak the context if the device
    /// may still write into it.
    pub fn finish(mut self, stats: &mut WorkerStats) -> Teardown {
        let remaining = self.drain(stats);
        if remaining > 0 {
            tracing::error!(
                worker = self.id,
                remaining,
                "operations still in flight after drain; leaking worker context"
            );
            std::mem::forget(self);
            return Teardown::Leaked(remaining);
        }
        drop(self);
        Teardown::Released
    }
}
