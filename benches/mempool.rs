//! Alloc/free hot-path benchmarks for the slab pool (§4.1), one size class
//! at a time plus the overflow path, against the system allocator directly
//! as a baseline.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use squall::mempool::{Pool, PoolConfig};

fn bench_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("mempool_alloc_free");

    for &size in &[16usize, 256, 4096, 8192, 1 << 16] {
        group.bench_with_input(BenchmarkId::new("pool", size), &size, |b, &size| {
            let pool = Pool::new(PoolConfig::default());
            b.iter(|| {
                let p = pool.alloc(black_box(size)).unwrap();
                pool.free(p);
            });
        });

        group.bench_with_input(BenchmarkId::new("system_allocator", size), &size, |b, &size| {
            b.iter(|| {
                let mut v: Vec<u8> = Vec::with_capacity(black_box(size));
                v.push(0);
                black_box(&v);
            });
        });
    }

    group.finish();
}

fn bench_prewarmed_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("mempool_prewarmed");
    group.bench_function("alloc_free_1024_prewarmed", |b| {
        let pool = Pool::new(PoolConfig { thread_safe: false, initial_blocks_per_class: 256 });
        b.iter(|| {
            let p = pool.alloc(black_box(1024)).unwrap();
            pool.free(p);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_alloc_free, bench_prewarmed_pool);
criterion_main!(benches);
