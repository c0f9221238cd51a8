//! Normal (single-threaded, doubling) queue.

use std::collections::VecDeque;

/// A circular-buffer FIFO that doubles on overflow. Single-threaded: no
/// synchronization, matching the spec's "normal" queue flavour. Backed by
/// `VecDeque`, which already implements the doubling ring buffer this
/// variant calls for.
pub struct Queue<T> {
    inner: VecDeque<T>,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self { inner: VecDeque::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { inner: VecDeque::with_capacity(capacity) }
    }

    pub fn enqueue(&mut self, value: T) {
        self.inner.push_back(value);
    }

    pub fn dequeue(&mut self) -> Option<T> {
        self.inner.pop_front()
    }

    pub fn peek(&self) -> Option<&T> {
        self.inner.front()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Remove every element, invoking `on_remove` for each (head to tail)
    /// before dropping it — mirrors the optional element-free hook the
    /// spec gives every queue variant's `clear`.
    pub fn clear_with<F: FnMut(T)>(&mut self, mut on_remove: F) {
        while let Some(value) = self.inner.pop_front() {
            on_remove(value);
        }
    }

    pub fn foreach<F: FnMut(&T)>(&self, mut f: F) {
        for item in &self.inner {
            f(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut q = Queue::new();
        q.enqueue(1);
        q.enqueue(2);
        q.enqueue(3);
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(2));
        assert_eq!(q.dequeue(), Some(3));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn clear_with_invokes_hook_in_order() {
        let mut q = Queue::new();
        q.enqueue(1);
        q.enqueue(2);
        let mut seen = Vec::new();
        q.clear_with(|v| seen.push(v));
        assert_eq!(seen, vec![1, 2]);
        assert!(q.is_empty());
    }
}
