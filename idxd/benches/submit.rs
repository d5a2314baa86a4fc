//! Descriptor preparation and emulated submission cost.
//!
//! Run with:
//! ```bash
//! cargo bench -p idxd --bench submit
//! ```

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use idxd::{
    BatchParams, CompSlot, CompletionPool, DescFlags, DescParams, DmaAddr, HostBuffer, HwDesc,
    Opcode, PollPolicy, Shared, SoftConfig, SoftPortal, SystemAllocator, WorkQueue,
};

const BLOCK: usize = 512;

fn bench_prep(c: &mut Criterion) {
    let mut group = c.benchmark_group("prep");
    group.throughput(Throughput::Elements(1));

    let mut desc = HwDesc::zeroed();
    let params = DescParams {
        opcode: Opcode::MemMove,
        pasid: 1,
        src: DmaAddr(0x7f00_0000_0000),
        dst: DmaAddr(0x2030_0000_0000),
        len: BLOCK as u32,
        completion: DmaAddr(0x7f00_1000_0000),
        flags: DescFlags::RCR | DescFlags::CRAV,
    };
    group.bench_function("memmove", |b| {
        b.iter(|| {
            desc.prep(std::hint::black_box(&params));
            std::hint::black_box(&desc);
        })
    });

    let batch = BatchParams {
        pasid: 1,
        desc_list: DmaAddr(0x7f00_2000_0000),
        count: 512,
        completion: DmaAddr(0x7f00_1000_0040),
        flags: DescFlags::RCR | DescFlags::CRAV,
    };
    group.bench_function("batch", |b| {
        b.iter(|| {
            desc.prep_batch(std::hint::black_box(&batch));
            std::hint::black_box(&desc);
        })
    });
    group.finish();
}

fn bench_soft_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("soft_submit_poll");

    for count in [2usize, 64, 512] {
        let src = HostBuffer::new(Arc::new(SystemAllocator), count * BLOCK).unwrap();
        let dst = HostBuffer::new(Arc::new(SystemAllocator), count * BLOCK).unwrap();
        let pool = Arc::new(CompletionPool::new());
        let slots: Vec<_> = (0..count).map(|_| CompSlot::new(pool.clone()).unwrap()).collect();
        let batch_slot = CompSlot::new(pool.clone()).unwrap();
        let wq: WorkQueue<_, Shared> =
            WorkQueue::new("wq0.0", SoftPortal::new("wq0.0", SoftConfig::default()), 32);

        let mut descs = vec![HwDesc::zeroed(); count];
        for (i, (d, slot)) in descs.iter_mut().zip(&slots).enumerate() {
            d.prep(&DescParams {
                opcode: Opcode::MemMove,
                pasid: 1,
                src: DmaAddr(src.as_ptr().as_ptr() as u64 + (i * BLOCK) as u64),
                dst: DmaAddr(dst.as_ptr().as_ptr() as u64 + (i * BLOCK) as u64),
                len: BLOCK as u32,
                completion: DmaAddr(slot.as_ptr().as_ptr() as u64),
                flags: DescFlags::RCR | DescFlags::CRAV,
            });
        }

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("individual", count), &count, |b, _| {
            b.iter(|| {
                for d in &descs {
                    wq.submit(d).unwrap();
                }
                for slot in &slots {
                    std::hint::black_box(slot.poll(PollPolicy::Unbounded));
                    slot.reset();
                }
            })
        });

        let mut batch = HwDesc::zeroed();
        batch.prep_batch(&BatchParams {
            pasid: 1,
            desc_list: DmaAddr(descs.as_ptr() as u64),
            count: count as u32,
            completion: DmaAddr(batch_slot.as_ptr().as_ptr() as u64),
            flags: DescFlags::RCR | DescFlags::CRAV,
        });
        group.bench_with_input(BenchmarkId::new("batch", count), &count, |b, _| {
            b.iter(|| {
                wq.submit(&batch).unwrap();
                std::hint::black_box(batch_slot.poll(PollPolicy::Unbounded));
                batch_slot.reset();
                for slot in &slots {
                    slot.reset();
                }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_prep, bench_soft_roundtrip);
criterion_main!(benches);
