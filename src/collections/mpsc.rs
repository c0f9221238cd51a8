//! Lock-free multi-producer single-consumer bounded queue.
//!
//! The classical Dmitry Vyukov sequenced-slot algorithm: each slot carries
//! its own 64-bit sequence counter, initialised to the slot's index.
//! Producers race a CAS on a shared tail counter; once a producer wins a
//! slot it writes the payload and release-stores `sequence = pos + 1`,
//! publishing it to the consumer. The consumer never competes with anyone
//! — it owns `head` outright — so it only needs an acquire-load of the
//! slot's sequence to know the value is ready.

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

struct Slot<T> {
    sequence: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded MPSC queue, capacity rounded up to a power of two.
pub struct MpscQueue<T> {
    buffer: Box<[CachePadded<Slot<T>>]>,
    mask: u64,
    enqueue_pos: CachePadded<AtomicU64>,
    dequeue_pos: CachePadded<AtomicUsize>,
}

// SAFETY: a slot's payload is written by exactly the producer that won the
// CAS for its position, and read by exactly the single consumer, gated in
// both directions by the slot's own sequence counter (release on publish,
// acquire on observe).
unsafe impl<T: Send> Send for MpscQueue<T> {}
unsafe impl<T: Send> Sync for MpscQueue<T> {}

impl<T> MpscQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let buffer = (0..capacity)
            .map(|i| {
                CachePadded::new(Slot {
                    sequence: AtomicU64::new(i as u64),
                    value: UnsafeCell::new(MaybeUninit::uninit()),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            buffer,
            mask: (capacity - 1) as u64,
            enqueue_pos: CachePadded::new(AtomicU64::new(0)),
            dequeue_pos: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        (self.mask + 1) as usize
    }

    /// Producer side, safe to call from any number of concurrent threads.
    /// Returns `Err(value)` if the queue is observed full.
    pub fn enqueue(&self, value: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[(pos & self.mask) as usize];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as i64 - pos as i64;

            if diff == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: this producer exclusively owns the slot
                        // until it publishes the new sequence below.
                        unsafe { (*slot.value.get()).write(value) };
                        slot.sequence.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return Err(value);
            } else {
                std::hint::spin_loop();
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Consumer side. Only one thread may call this concurrently (the
    /// queue's single-consumer contract is not enforced at the type level,
    /// matching the spec's "MPSC" naming — callers own that discipline).
    pub fn dequeue(&self) -> Option<T> {
        let pos = self.dequeue_pos.load(Ordering::Relaxed);
        let slot = &self.buffer[pos & self.mask as usize];
        let seq = slot.sequence.load(Ordering::Acquire);
        let diff = seq as i64 - (pos as i64 + 1);

        if diff == 0 {
            self.dequeue_pos.store(pos + 1, Ordering::Relaxed);
            // SAFETY: the sequence check confirms a producer has published
            // this slot and no other consumer can observe it (single
            // consumer contract).
            let value = unsafe { (*slot.value.get()).assume_init_read() };
            slot.sequence.store(pos as u64 + self.capacity() as u64, Ordering::Release);
            Some(value)
        } else {
            None
        }
    }

    /// Best-effort estimate only — see the spec's design notes on
    /// `size()` under concurrency.
    pub fn len_estimate(&self) -> usize {
        let enq = self.enqueue_pos.load(Ordering::Relaxed);
        let deq = self.dequeue_pos.load(Ordering::Relaxed) as u64;
        enq.saturating_sub(deq) as usize
    }
}

impl<T> Drop for MpscQueue<T> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_producer_fifo() {
        let q: MpscQueue<i32> = MpscQueue::with_capacity(4);
        q.enqueue(1).unwrap();
        q.enqueue(2).unwrap();
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(2));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn full_queue_rejects() {
        let q: MpscQueue<i32> = MpscQueue::with_capacity(2);
        q.enqueue(1).unwrap();
        q.enqueue(2).unwrap();
        assert!(q.enqueue(3).is_err());
    }

    #[test]
    fn multi_producer_preserves_all_items_and_local_order() {
        const PRODUCERS: i32 = 4;
        const PER_PRODUCER: i32 = 2_000;
        let q = Arc::new(MpscQueue::<(i32, i32)>::with_capacity(1024));

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let mut i = 0;
                    while i < PER_PRODUCER {
                        if q.enqueue((p, i)).is_ok() {
                            i += 1;
                        } else {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let total = (PRODUCERS * PER_PRODUCER) as usize;
        let mut received = Vec::with_capacity(total);
        while received.len() < total {
            if let Some(item) = q.dequeue() {
                received.push(item);
            } else {
                thread::yield_now();
            }
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(received.len(), total);
        let unique: HashSet<_> = received.iter().copied().collect();
        assert_eq!(unique.len(), total);

        let mut last_per_producer = vec![-1; PRODUCERS as usize];
        for (p, i) in received {
            assert!(i > last_per_producer[p as usize]);
            last_per_producer[p as usize] = i;
        }
    }
}
