//! Enqueue/dequeue throughput for the three queue flavours (§4.2): the
//! single-threaded doubling queue as a baseline, and the lock-free SPSC/MPSC
//! rings under single-threaded load (no contention, so this isolates
//! per-operation overhead rather than scalability).

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use squall::collections::{MpscQueue, Queue, SpscQueue};

fn bench_normal_queue(c: &mut Criterion) {
    c.bench_function("normal_queue_enqueue_dequeue", |b| {
        let mut q: Queue<u64> = Queue::with_capacity(1024);
        let mut i = 0u64;
        b.iter(|| {
            q.enqueue(black_box(i));
            i = i.wrapping_add(1);
            black_box(q.dequeue());
        });
    });
}

fn bench_spsc_queue(c: &mut Criterion) {
    c.bench_function("spsc_queue_enqueue_dequeue", |b| {
        let q: SpscQueue<u64> = SpscQueue::with_capacity(1024);
        let mut i = 0u64;
        b.iter(|| {
            q.enqueue(black_box(i)).unwrap();
            i = i.wrapping_add(1);
            black_box(q.dequeue());
        });
    });
}

fn bench_mpsc_queue(c: &mut Criterion) {
    c.bench_function("mpsc_queue_enqueue_dequeue", |b| {
        let q: MpscQueue<u64> = MpscQueue::with_capacity(1024);
        let mut i = 0u64;
        b.iter(|| {
            q.enqueue(black_box(i)).unwrap();
            i = i.wrapping_add(1);
            black_box(q.dequeue());
        });
    });
}

criterion_group!(benches, bench_normal_queue, bench_spsc_queue, bench_mpsc_queue);
criterion_main!(benches);
