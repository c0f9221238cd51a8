//! Lock-free single-producer single-consumer ring buffer.
//!
//! Power-of-two capacity; `head`/`tail` are atomic indices, unwrapped
//! (monotonically increasing) and masked on access. The producer writes the
//! slot before releasing `tail`; the consumer acquires `tail` before
//! reading the slot, exactly the invariant the spec calls out in §4.2.

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A bounded SPSC queue. Clone-free: producer and consumer each hold a
/// `&SpscQueue<T>` (typically via `Arc`), matching the single-writer/
/// single-reader contract of the spec rather than exposing separate handle
/// types.
pub struct SpscQueue<T> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

// SAFETY: access to `buffer` slots is partitioned between exactly one
// producer (writes slot `tail & mask`, then releases `tail`) and one
// consumer (acquires `tail`, reads slot `head & mask`, then releases
// `head`); no two threads ever touch the same slot concurrently.
unsafe impl<T: Send> Send for SpscQueue<T> {}
unsafe impl<T: Send> Sync for SpscQueue<T> {}

impl<T> SpscQueue<T> {
    /// Create a queue with the given capacity, rounded up to the next
    /// power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let buffer = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buffer,
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Producer side: attempt to enqueue. Returns `Err(value)` if full.
    pub fn enqueue(&self, value: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.capacity() {
            return Err(value);
        }

        let slot = &self.buffer[tail & self.mask];
        // SAFETY: only the producer writes this slot, and only after
        // confirming it isn't currently owned by the consumer (above).
        unsafe { (*slot.get()).write(value) };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer side: attempt to dequeue. Returns `None` if empty.
    pub fn dequeue(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }

        let slot = &self.buffer[head & self.mask];
        // SAFETY: the producer published this slot's value via the
        // Acquire load of `tail` above (Release-paired in `enqueue`), and
        // only the consumer ever reads it.
        let value = unsafe { (*slot.get()).assume_init_read() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for SpscQueue<T> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_threaded_fifo() {
        let q: SpscQueue<i32> = SpscQueue::with_capacity(4);
        q.enqueue(1).unwrap();
        q.enqueue(2).unwrap();
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(2));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn full_queue_rejects() {
        let q: SpscQueue<i32> = SpscQueue::with_capacity(2);
        q.enqueue(1).unwrap();
        q.enqueue(2).unwrap();
        assert!(q.enqueue(3).is_err());
    }

    #[test]
    fn concurrent_producer_consumer_preserves_order() {
        const N: i32 = 10_000;
        let q = Arc::new(SpscQueue::<i32>::with_capacity(64));
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let mut i = 0;
                while i < N {
                    if q.enqueue(i).is_ok() {
                        i += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            })
        };

        let mut received = Vec::with_capacity(N as usize);
        while received.len() < N as usize {
            if let Some(v) = q.dequeue() {
                received.push(v);
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert_eq!(received, (0..N).collect::<Vec<_>>());
    }
}
