//! Mapped memory manager benchmarks.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use mapped_memory::allocator::{FencedAllocator, MappedMemoryManager, MemoryLimit};
use mapped_memory::command::{FenceSync, InProcessCommandBuffer};
use std::sync::Arc;

fn bench_fenced_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("fenced_alloc_free");
    let helper = InProcessCommandBuffer::new();

    for live in [0usize, 16, 256] {
        let mut allocator = FencedAllocator::new(1 << 20);
        // Fragment the front of the buffer so first-fit has to scan.
        let held: Vec<_> = (0..live * 2)
            .map(|_| allocator.alloc(64).expect("buffer is large enough"))
            .collect();
        for offset in held.iter().step_by(2) {
            allocator.free(*offset);
        }

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(live), &live, |b, _| {
            b.iter(|| {
                let offset = allocator.alloc(128).expect("buffer is large enough");
                allocator.free_pending_token(offset, helper.insert_token());
                helper.finish();
                allocator.free_unused(&helper);
            });
        });
    }

    group.finish();
}

fn bench_manager_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("manager_alloc_free");

    for size in [64u32, 1024, 16 * 1024] {
        let helper = Arc::new(InProcessCommandBuffer::new());
        let mut manager = MappedMemoryManager::new(helper.clone(), MemoryLimit::Unbounded);
        manager.set_chunk_size_multiple(1 << 20);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let allocation = manager.alloc(size).expect("unbounded");
                manager.free(std::hint::black_box(allocation).ptr());
            });
        });
    }

    group.finish();
}

fn bench_manager_pending_reuse(c: &mut Criterion) {
    let mut group = c.benchmark_group("manager_pending_reuse");

    let helper = Arc::new(InProcessCommandBuffer::new());
    let mut manager = MappedMemoryManager::new(helper.clone(), MemoryLimit::Bytes(64 * 1024));
    manager.set_chunk_size_multiple(64 * 1024);

    group.throughput(Throughput::Elements(64));
    group.bench_function("64_uploads_per_frame", |b| {
        b.iter(|| {
            for _ in 0..64 {
                let allocation = manager.alloc(1024).expect("reclaim keeps memory bounded");
                manager.free_pending_token(allocation.ptr(), helper.insert_token());
            }
            helper.flush();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_fenced_alloc_free,
    bench_manager_alloc_free,
    bench_manager_pending_reuse
);
criterion_main!(benches);
