//! Data-path benchmarks.
//!
//! Measures the per-packet cost of the packet-buffer pool: chain
//! allocation with copy, gather-list construction, and linearization.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use tunsocks::stack::PbufPool;

fn bench_chain_alloc(c: &mut Criterion) {
    let pool = PbufPool::new(1024);
    let frame = vec![0xA5u8; 1500];

    let mut group = c.benchmark_group("chain_alloc");
    group.throughput(Throughput::Bytes(1500));

    group.bench_function("1500_bytes", |b| {
        b.iter(|| black_box(pool.alloc_copy(black_box(&frame))))
    });

    group.finish();
}

fn bench_gather_list(c: &mut Criterion) {
    let pool = PbufPool::new(1024);
    let frame = vec![0xA5u8; 1500];
    let chain = pool.alloc_copy(&frame).unwrap();

    let mut group = c.benchmark_group("gather_list");
    group.throughput(Throughput::Bytes(1500));

    group.bench_function("1500_bytes", |b| b.iter(|| black_box(chain.io_slices())));

    group.finish();
}

fn bench_linearize(c: &mut Criterion) {
    let pool = PbufPool::new(1024);
    let frame = vec![0xA5u8; 1500];
    let chain = pool.alloc_copy(&frame).unwrap();

    let mut group = c.benchmark_group("linearize");
    group.throughput(Throughput::Bytes(1500));

    group.bench_function("1500_bytes", |b| b.iter(|| black_box(chain.to_vec())));

    group.finish();
}

criterion_group!(
    benches,
    bench_chain_alloc,
    bench_gather_list,
    bench_linearize
);
criterion_main!(benches);
