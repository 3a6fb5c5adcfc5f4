use criterion::{black_box, criterion_group, criterion_main, Criterion};
use strata_core::{BufferDesc, BufferUsage, CompletionStamp, MemoryDomain};
use strata_gpu::{FreeListRegion, HeadlessBackend, PersistentAllocator, TransientAllocator};

const PAGE: u64 = 2 * 1024 * 1024;

fn bench_free_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("Free list");

    group.bench_function("allocate/free 256 mixed sizes", |b| {
        let mut region = FreeListRegion::new(PAGE);
        b.iter(|| {
            let mut live = Vec::with_capacity(256);
            for i in 0..256u64 {
                let size = 64 + (i * 97) % 4096;
                if let Some(offset) = region.allocate(size, 256) {
                    live.push((offset, size));
                }
            }
            // free every other block first to force coalescing work
            for (offset, size) in live.iter().step_by(2) {
                region.free(*offset, *size);
            }
            for (offset, size) in live.iter().skip(1).step_by(2) {
                region.free(*offset, *size);
            }
            black_box(region.free_block_count());
        });
    });

    group.finish();
}

fn bench_persistent(c: &mut Criterion) {
    let backend = HeadlessBackend::default();
    let mut allocator = PersistentAllocator::<HeadlessBackend>::new(PAGE, PAGE / 2);
    let mut staging = TransientAllocator::<HeadlessBackend>::new(PAGE);
    let data = vec![0xA5u8; 1024];

    let mut group = c.benchmark_group("Persistent allocator");

    group.bench_function("host-visible churn", |b| {
        let desc = BufferDesc::new(1024, BufferUsage::UNIFORM).with_domain(MemoryDomain::Upload);
        b.iter(|| {
            let allocs: Vec<_> = (0..64)
                .filter_map(|_| {
                    allocator
                        .alloc(&backend, &mut staging, &desc, Some(&data))
                        .ok()
                })
                .collect();
            for alloc in allocs {
                allocator.free(&backend, alloc);
            }
        });
    });

    group.bench_function("device-local staged", |b| {
        let desc = BufferDesc::new(1024, BufferUsage::VERTEX);
        b.iter(|| {
            let allocs: Vec<_> = (0..64)
                .filter_map(|_| {
                    allocator
                        .alloc(&backend, &mut staging, &desc, Some(&data))
                        .ok()
                })
                .collect();
            black_box(allocator.take_uploads().len());
            for alloc in allocs {
                allocator.free(&backend, alloc);
            }
            staging.reset(CompletionStamp::ZERO);
            staging.reclaim(&CompletionStamp::ZERO);
        });
    });

    group.finish();
    allocator.destroy(&backend);
    staging.destroy(&backend);
}

criterion_group!(benches, bench_free_list, bench_persistent);
criterion_main!(benches);
