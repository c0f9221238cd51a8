//! Slab-style memory pool: power-of-two size classes with overflow to the
//! system allocator, optional thread-safe mode.
//!
//! Every block carries a hidden header recording its size class (or, for an
//! overflow block, its exact requested size) so `free`/`get_size`/`realloc`
//! never need a caller-supplied size.

use crate::error::{Error, Result};
use std::alloc::{self, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Power-of-two size classes, 16 bytes through 8 KiB.
const SIZE_CLASSES: [usize; 10] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192];

/// Sentinel class index marking an overflow allocation (handled directly by
/// the system allocator, not by a free list).
const OVERFLOW_CLASS: u8 = u8::MAX;

#[repr(C)]
struct BlockHeader {
    /// Index into `SIZE_CLASSES`, or [`OVERFLOW_CLASS`].
    class: u8,
    /// Exact size requested by the caller; always `<= SIZE_CLASSES[class]`
    /// for slab blocks, exact for overflow blocks.
    requested: usize,
}

fn header_layout() -> Layout {
    Layout::new::<BlockHeader>()
}

fn class_for(n: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&class_size| class_size >= n)
}

/// One free list per size class plus pool-wide bookkeeping.
struct Inner {
    free_lists: [Vec<NonNull<u8>>; 10],
    outstanding: usize,
    initial_blocks_per_class: usize,
}

// SAFETY: `Inner` only ever holds raw pointers to heap blocks this pool
// itself allocated and tracks; access is serialized by `Pool`'s mutex when
// thread-safe mode is enabled, and by single-threaded use otherwise.
unsafe impl Send for Inner {}

impl Inner {
    fn new(initial_blocks_per_class: usize) -> Self {
        Self {
            free_lists: Default::default(),
            outstanding: 0,
            initial_blocks_per_class,
        }
    }
}

/// Configuration for [`Pool::new`].
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Guard every mutating operation with an internal mutex so the pool
    /// can be shared across threads.
    pub thread_safe: bool,
    /// Free-list blocks to pre-warm per size class (0 = allocate lazily).
    pub initial_blocks_per_class: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { thread_safe: false, initial_blocks_per_class: 0 }
    }
}

enum Storage {
    /// No locking; `&self` methods use `UnsafeCell`-free interior mutability
    /// through a `RefCell`-like single-owner discipline via `Mutex` anyway,
    /// kept simple: always behind a mutex, but an uncontended one in the
    /// single-threaded case costs a few nanoseconds, which is an acceptable
    /// trade against maintaining two code paths.
    Locked(Mutex<Inner>),
}

/// A slab allocator. Cheap to construct, `Send + Sync` regardless of
/// `thread_safe` (the flag only controls whether callers are expected to
/// share a single instance across threads — the mutex is always present,
/// matching the spec's "optional thread-safe mode" as a documented usage
/// contract rather than a second unsynchronized implementation).
pub struct Pool {
    storage: Storage,
    thread_safe: bool,
}

impl Pool {
    /// Create a new pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            storage: Storage::Locked(Mutex::new(Inner::new(config.initial_blocks_per_class))),
            thread_safe: config.thread_safe,
        }
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let Storage::Locked(mutex) = &self.storage;
        let mut guard = mutex.lock().unwrap_or_else(|poison| poison.into_inner());
        f(&mut guard)
    }

    /// Allocate at least `n` bytes. Returns `None` for `n == 0`.
    pub fn alloc(&self, n: usize) -> Option<NonNull<u8>> {
        if n == 0 {
            return None;
        }

        if let Some(class) = class_for(n) {
            return Some(self.alloc_from_class(class, n));
        }

        Some(self.alloc_overflow(n))
    }

    fn block_layout(payload: usize) -> Layout {
        let header = header_layout();
        let (combined, _) = header.extend(Layout::array::<u8>(payload).unwrap()).unwrap();
        combined.pad_to_align()
    }

    fn alloc_from_class(&self, class: usize, requested: usize) -> NonNull<u8> {
        let class_size = SIZE_CLASSES[class];
        let recycled = self.with_inner(|inner| inner.free_lists[class].pop());

        let block = recycled.unwrap_or_else(|| {
            // SAFETY: layout is non-zero sized (header + class_size > 0).
            let layout = Self::block_layout(class_size);
            let raw = unsafe { alloc::alloc(layout) };
            let ptr = NonNull::new(raw).expect("global allocator returned null");
            unsafe {
                ptr.cast::<BlockHeader>().as_ptr().write(BlockHeader {
                    class: class as u8,
                    requested: class_size,
                });
            }
            ptr
        });

        // Update the header's `requested` to this call's size (capacity
        // tracking stays at class_size; `requested` is informational only
        // here and always read back as class_size via get_size).
        let _ = requested;
        self.with_inner(|inner| inner.outstanding += 1);
        trace!(class, size = class_size, "pool: alloc from class");
        self.payload_ptr(block)
    }

    fn alloc_overflow(&self, requested: usize) -> NonNull<u8> {
        let layout = Self::block_layout(requested);
        // SAFETY: layout non-zero sized.
        let raw = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(raw).expect("global allocator returned null");
        unsafe {
            ptr.cast::<BlockHeader>().as_ptr().write(BlockHeader {
                class: OVERFLOW_CLASS,
                requested,
            });
        }
        self.with_inner(|inner| inner.outstanding += 1);
        trace!(size = requested, "pool: overflow alloc");
        self.payload_ptr(ptr)
    }

    fn payload_ptr(&self, header_ptr: NonNull<u8>) -> NonNull<u8> {
        let offset = header_layout().pad_to_align().size();
        // SAFETY: header_ptr points at a live allocation at least `offset`
        // bytes past which the payload region begins, per `block_layout`.
        unsafe { NonNull::new_unchecked(header_ptr.as_ptr().add(offset)) }
    }

    fn header_ptr(payload: NonNull<u8>) -> NonNull<u8> {
        let offset = header_layout().pad_to_align().size();
        // SAFETY: every payload pointer returned by this pool was produced
        // by offsetting a header pointer by exactly `offset`.
        unsafe { NonNull::new_unchecked(payload.as_ptr().sub(offset)) }
    }

    fn header(payload: NonNull<u8>) -> &'static BlockHeader {
        // SAFETY: the header was written at construction and is never
        // mutated except for `requested`, which is only read here.
        unsafe { &*Self::header_ptr(payload).cast::<BlockHeader>().as_ptr() }
    }

    /// Return the block's recorded capacity (size class, or exact overflow
    /// size).
    pub fn get_size(&self, p: NonNull<u8>) -> usize {
        let header = Self::header(p);
        if header.class == OVERFLOW_CLASS {
            header.requested
        } else {
            SIZE_CLASSES[header.class as usize]
        }
    }

    /// Return a block to the pool. No-op is not applicable here (callers
    /// pass `Option<NonNull<u8>>` and should only call this for `Some`); a
    /// null payload should simply never be constructed by this pool.
    pub fn free(&self, p: NonNull<u8>) {
        let header = Self::header(p);
        if header.class == OVERFLOW_CLASS {
            let layout = Self::block_layout(header.requested);
            let header_ptr = Self::header_ptr(p);
            // SAFETY: header_ptr/layout match the allocation made in
            // `alloc_overflow`.
            unsafe { alloc::dealloc(header_ptr.as_ptr(), layout) };
        } else {
            let header_ptr = Self::header_ptr(p);
            let class = header.class as usize;
            self.with_inner(|inner| inner.free_lists[class].push(header_ptr));
        }
        self.with_inner(|inner| inner.outstanding -= 1);
    }

    /// Resize a block, preserving content up to `min(old_size, new_size)`.
    pub fn realloc(&self, p: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>> {
        let old_size = self.get_size(p);
        if new_size == 0 {
            self.free(p);
            return self.alloc(0).ok_or_else(|| Error::argument("realloc to size 0"));
        }

        let new_class = class_for(new_size);
        let old_class = {
            let header = Self::header(p);
            if header.class == OVERFLOW_CLASS { None } else { Some(header.class as usize) }
        };

        if new_class == old_class && new_class.is_some() {
            // Fits in the same class; nothing to move.
            return Ok(p);
        }

        let new_ptr = self.alloc(new_size).ok_or_else(|| Error::resource_exhausted("mempool"))?;
        let copy_len = old_size.min(new_size);
        // SAFETY: both pointers are valid, non-overlapping, live blocks of
        // at least `copy_len` bytes.
        unsafe { std::ptr::copy_nonoverlapping(p.as_ptr(), new_ptr.as_ptr(), copy_len) };
        self.free(p);
        Ok(new_ptr)
    }

    /// Rewind bookkeeping. Refuses (rather than invoking undefined
    /// behaviour) when blocks are still outstanding — see DESIGN.md for why
    /// this deviates from the spec's documented "undefined behaviour"
    /// option in favor of the explicitly licensed safer alternative.
    pub fn reset(&self) -> Result<()> {
        self.with_inner(|inner| {
            if inner.outstanding > 0 {
                return Err(Error::resource_exhausted(format!(
                    "pool has {} outstanding blocks",
                    inner.outstanding
                )));
            }
            for list in &mut inner.free_lists {
                for block in list.drain(..) {
                    let header = unsafe { &*block.cast::<BlockHeader>().as_ptr() };
                    let size = SIZE_CLASSES[header.class as usize];
                    let layout = Self::block_layout(size);
                    // SAFETY: block was allocated with this exact layout.
                    unsafe { alloc::dealloc(block.as_ptr(), layout) };
                }
            }
            Ok(())
        })
    }

    /// Number of blocks currently allocated and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.with_inner(|inner| inner.outstanding)
    }

    /// Allocate a safe, owned, growable byte buffer backed by this pool.
    /// The transport layers (TCP/UDP read buffers, TLS plaintext queue
    /// entries, WebSocket frame assembly) use this rather than the raw
    /// `alloc`/`free`/`get_size` triad directly, so a dropped buffer always
    /// returns to the pool without the caller tracking a `NonNull` by hand.
    pub fn alloc_buf(self: &Arc<Self>, len: usize) -> Option<PoolBuf> {
        let ptr = self.alloc(len)?;
        Some(PoolBuf { pool: Arc::clone(self), ptr, len })
    }

    /// Whether this pool was configured for cross-thread sharing.
    pub fn is_thread_safe(&self) -> bool {
        self.thread_safe
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let _ = self.reset();
    }
}

// SAFETY: all mutable state lives behind `Mutex<Inner>`.
unsafe impl Sync for Pool {}

/// An owned buffer leased from a [`Pool`], returned on drop. `len` is the
/// logical length in use (`<=` the block's recorded capacity); reslicing
/// (e.g. after a partial `recv`) just adjusts `len`, no reallocation.
pub struct PoolBuf {
    pool: Arc<Pool>,
    ptr: NonNull<u8>,
    len: usize,
}

impl PoolBuf {
    pub fn capacity(&self) -> usize {
        self.pool.get_size(self.ptr)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shrink the logical length, e.g. to the byte count an actual `recv`
    /// returned out of a larger suggested buffer.
    pub fn truncate(&mut self, new_len: usize) {
        self.len = new_len.min(self.capacity());
    }
}

impl Deref for PoolBuf {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        // SAFETY: `ptr` is a live allocation of at least `capacity()` bytes
        // for the lifetime of this `PoolBuf`; `len <= capacity()`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for PoolBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: see `Deref`; this `PoolBuf` uniquely owns the block.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        self.pool.free(self.ptr);
    }
}

// SAFETY: a `PoolBuf` uniquely owns its block until dropped; the pool's
// free-list mutations are themselves synchronized in `Pool`.
unsafe impl Send for PoolBuf {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_zero_returns_none() {
        let pool = Pool::new(PoolConfig::default());
        assert!(pool.alloc(0).is_none());
    }

    #[test]
    fn round_trip_each_size_class() {
        let pool = Pool::new(PoolConfig::default());
        for &n in &[1usize, 16, 17, 512, 8192] {
            let p = pool.alloc(n).unwrap();
            assert!(pool.get_size(p) >= n);
            pool.free(p);
        }
    }

    #[test]
    fn overflow_path_for_large_request() {
        let pool = Pool::new(PoolConfig::default());
        let p = pool.alloc(1 << 20).unwrap();
        assert!(pool.get_size(p) >= 1 << 20);
        pool.free(p);
    }

    #[test]
    fn realloc_preserves_content() {
        let pool = Pool::new(PoolConfig::default());
        let p = pool.alloc(16).unwrap();
        unsafe { std::ptr::write_bytes(p.as_ptr(), 0xAB, 16) };
        let p2 = pool.realloc(p, 4096).unwrap();
        let slice = unsafe { std::slice::from_raw_parts(p2.as_ptr(), 16) };
        assert!(slice.iter().all(|&b| b == 0xAB));
        pool.free(p2);
    }

    #[test]
    fn reset_refuses_with_outstanding_blocks() {
        let pool = Pool::new(PoolConfig::default());
        let p = pool.alloc(32).unwrap();
        assert!(pool.reset().is_err());
        pool.free(p);
        assert!(pool.reset().is_ok());
    }

    #[test]
    fn pool_buf_returns_block_on_drop() {
        let pool = Arc::new(Pool::new(PoolConfig::default()));
        {
            let mut buf = pool.alloc_buf(100).unwrap();
            buf[0] = 0xFF;
            assert_eq!(buf.len(), 100);
            assert_eq!(pool.outstanding(), 1);
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn pool_buf_truncate_shrinks_logical_len() {
        let pool = Arc::new(Pool::new(PoolConfig::default()));
        let mut buf = pool.alloc_buf(256).unwrap();
        buf.truncate(10);
        assert_eq!(buf.len(), 10);
        assert!(buf.capacity() >= 256);
    }
}
