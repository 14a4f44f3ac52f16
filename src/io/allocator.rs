//! Pooled allocation of byte and text buffers.
//!
//! A [`BufferAllocator`] hands out [`Buffer`] and [`TextBuffer`] leases.
//! Dropping a lease returns the backing storage to the allocator, which
//! pools it when the configured caps allow and frees it otherwise. The
//! allocator is the only object in this crate that may be shared between
//! readers and writers; its free lists sit behind plain mutexes because
//! acquisition happens at endpoint construction and scratch-path
//! boundaries, never in per-value hot paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::codec::{Error, Result};

/// Capacity caps for a [`BufferAllocator`].
#[derive(Debug, Clone, Copy)]
pub struct AllocatorOptions {
    /// Largest byte buffer an acquire may request.
    pub max_byte_buffer_capacity: usize,
    /// Largest text buffer an acquire may request.
    pub max_text_buffer_capacity: usize,
    /// Largest byte buffer the pool will retain on release.
    pub max_pooled_byte_buffer_capacity: usize,
    /// Largest text buffer the pool will retain on release.
    pub max_pooled_text_buffer_capacity: usize,
    /// Total byte capacity the byte pool may hold.
    pub max_byte_buffer_pool_capacity: usize,
    /// Total byte capacity the text pool may hold.
    pub max_text_buffer_pool_capacity: usize,
}

impl Default for AllocatorOptions {
    fn default() -> Self {
        Self {
            max_byte_buffer_capacity: 16 * 1024 * 1024,
            max_text_buffer_capacity: 1024 * 1024,
            max_pooled_byte_buffer_capacity: 1024 * 1024,
            max_pooled_text_buffer_capacity: 64 * 1024,
            max_byte_buffer_pool_capacity: 64 * 1024 * 1024,
            max_text_buffer_pool_capacity: 16 * 1024 * 1024,
        }
    }
}

/// Snapshot of allocator activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Byte buffer acquisitions.
    pub byte_acquires: u64,
    /// Byte buffer acquisitions served from the pool.
    pub byte_pool_hits: u64,
    /// Byte buffers retained by the pool on release.
    pub byte_buffers_pooled: u64,
    /// Byte buffers freed on release.
    pub byte_buffers_discarded: u64,
    /// Text buffer acquisitions.
    pub text_acquires: u64,
    /// Text buffer acquisitions served from the pool.
    pub text_pool_hits: u64,
    /// Text buffers retained by the pool on release.
    pub text_buffers_pooled: u64,
    /// Text buffers freed on release.
    pub text_buffers_discarded: u64,
}

struct Counters {
    byte_acquires: AtomicU64,
    byte_pool_hits: AtomicU64,
    byte_buffers_pooled: AtomicU64,
    byte_buffers_discarded: AtomicU64,
    text_acquires: AtomicU64,
    text_pool_hits: AtomicU64,
    text_buffers_pooled: AtomicU64,
    text_buffers_discarded: AtomicU64,
}

impl Counters {
    const fn new() -> Self {
        Self {
            byte_acquires: AtomicU64::new(0),
            byte_pool_hits: AtomicU64::new(0),
            byte_buffers_pooled: AtomicU64::new(0),
            byte_buffers_discarded: AtomicU64::new(0),
            text_acquires: AtomicU64::new(0),
            text_pool_hits: AtomicU64::new(0),
            text_buffers_pooled: AtomicU64::new(0),
            text_buffers_discarded: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> AllocatorStats {
        AllocatorStats {
            byte_acquires: self.byte_acquires.load(Ordering::Relaxed),
            byte_pool_hits: self.byte_pool_hits.load(Ordering::Relaxed),
            byte_buffers_pooled: self.byte_buffers_pooled.load(Ordering::Relaxed),
            byte_buffers_discarded: self.byte_buffers_discarded.load(Ordering::Relaxed),
            text_acquires: self.text_acquires.load(Ordering::Relaxed),
            text_pool_hits: self.text_pool_hits.load(Ordering::Relaxed),
            text_buffers_pooled: self.text_buffers_pooled.load(Ordering::Relaxed),
            text_buffers_discarded: self.text_buffers_discarded.load(Ordering::Relaxed),
        }
    }
}

/// Free storage keyed by capacity; lookups take the smallest fit.
struct FreeList<T> {
    free: BTreeMap<usize, Vec<T>>,
    total_capacity: usize,
}

impl<T> FreeList<T> {
    fn new() -> Self {
        Self {
            free: BTreeMap::new(),
            total_capacity: 0,
        }
    }

    fn take(&mut self, min_capacity: usize) -> Option<T> {
        let capacity = self
            .free
            .range(min_capacity..)
            .find(|(_, bucket)| !bucket.is_empty())
            .map(|(&capacity, _)| capacity)?;
        let bucket = self.free.get_mut(&capacity)?;
        let item = bucket.pop()?;
        if bucket.is_empty() {
            self.free.remove(&capacity);
        }
        self.total_capacity -= capacity;
        Some(item)
    }

    fn put(&mut self, capacity: usize, item: T) {
        self.free.entry(capacity).or_default().push(item);
        self.total_capacity += capacity;
    }

    fn clear(&mut self) {
        self.free.clear();
        self.total_capacity = 0;
    }
}

enum PoolMode {
    Unpooled,
    Pooled {
        bytes: Mutex<FreeList<Box<[u8]>>>,
        text: Mutex<FreeList<String>>,
    },
}

struct AllocatorInner {
    mode: PoolMode,
    options: AllocatorOptions,
    closed: AtomicBool,
    counters: Counters,
}

/// Shared allocator for the internal buffers of sources, sinks, and the
/// string codec scratch paths.
#[derive(Clone)]
pub struct BufferAllocator {
    inner: Arc<AllocatorInner>,
}

impl BufferAllocator {
    /// Create a pooling allocator with the given caps.
    #[must_use]
    pub fn pooled(options: AllocatorOptions) -> Self {
        Self {
            inner: Arc::new(AllocatorInner {
                mode: PoolMode::Pooled {
                    bytes: Mutex::new(FreeList::new()),
                    text: Mutex::new(FreeList::new()),
                },
                options,
                closed: AtomicBool::new(false),
                counters: Counters::new(),
            }),
        }
    }

    /// Create an allocator that allocates fresh storage on every acquire
    /// and frees it on every release.
    #[must_use]
    pub fn unpooled() -> Self {
        Self::unpooled_with(AllocatorOptions::default())
    }

    /// Unpooled allocator with explicit acquire caps.
    #[must_use]
    pub fn unpooled_with(options: AllocatorOptions) -> Self {
        Self {
            inner: Arc::new(AllocatorInner {
                mode: PoolMode::Unpooled,
                options,
                closed: AtomicBool::new(false),
                counters: Counters::new(),
            }),
        }
    }

    /// Acquire a byte buffer of capacity at least `capacity`.
    ///
    /// The pool reuses the smallest fit when one is available; otherwise a
    /// fresh power-of-two block is allocated.
    pub fn acquire_bytes(&self, capacity: usize) -> Result<Buffer> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Relaxed) {
            return Err(Error::AllocatorClosed);
        }
        if capacity > inner.options.max_byte_buffer_capacity {
            return Err(Error::CapacityExceeded {
                requested: capacity,
                max: inner.options.max_byte_buffer_capacity,
            });
        }
        inner.counters.byte_acquires.fetch_add(1, Ordering::Relaxed);
        if let PoolMode::Pooled { bytes, .. } = &inner.mode {
            let pooled = bytes.lock().expect("byte pool mutex poisoned").take(capacity);
            if let Some(data) = pooled {
                inner.counters.byte_pool_hits.fetch_add(1, Ordering::Relaxed);
                trace!(capacity = data.len(), requested = capacity, "reusing pooled byte buffer");
                return Ok(Buffer {
                    data: Some(data),
                    owner: Arc::clone(inner),
                });
            }
        }
        let data = vec![0u8; capacity.next_power_of_two()].into_boxed_slice();
        Ok(Buffer {
            data: Some(data),
            owner: Arc::clone(inner),
        })
    }

    /// Acquire a text buffer of capacity at least `capacity` bytes,
    /// cleared and ready for appends.
    pub fn acquire_text(&self, capacity: usize) -> Result<TextBuffer> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Relaxed) {
            return Err(Error::AllocatorClosed);
        }
        if capacity > inner.options.max_text_buffer_capacity {
            return Err(Error::CapacityExceeded {
                requested: capacity,
                max: inner.options.max_text_buffer_capacity,
            });
        }
        inner.counters.text_acquires.fetch_add(1, Ordering::Relaxed);
        if let PoolMode::Pooled { text, .. } = &inner.mode {
            let pooled = text.lock().expect("text pool mutex poisoned").take(capacity);
            if let Some(mut data) = pooled {
                data.clear();
                inner.counters.text_pool_hits.fetch_add(1, Ordering::Relaxed);
                trace!(capacity = data.capacity(), requested = capacity, "reusing pooled text buffer");
                return Ok(TextBuffer {
                    data: Some(data),
                    owner: Arc::clone(inner),
                });
            }
        }
        let data = String::with_capacity(capacity.next_power_of_two());
        Ok(TextBuffer {
            data: Some(data),
            owner: Arc::clone(inner),
        })
    }

    /// Drop all pooled storage and fail every subsequent acquire.
    ///
    /// Leases still out return their storage to the heap, not the pool.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
        if let PoolMode::Pooled { bytes, text } = &self.inner.mode {
            bytes.lock().expect("byte pool mutex poisoned").clear();
            text.lock().expect("text pool mutex poisoned").clear();
        }
    }

    /// Whether [`Self::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }

    /// Snapshot of the allocator's activity counters.
    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        self.inner.counters.snapshot()
    }

    /// Total capacity currently held by the byte pool, in bytes.
    #[must_use]
    pub fn pooled_byte_capacity(&self) -> usize {
        match &self.inner.mode {
            PoolMode::Unpooled => 0,
            PoolMode::Pooled { bytes, .. } => {
                bytes.lock().expect("byte pool mutex poisoned").total_capacity
            }
        }
    }

    /// Total capacity currently held by the text pool, in bytes.
    #[must_use]
    pub fn pooled_text_capacity(&self) -> usize {
        match &self.inner.mode {
            PoolMode::Unpooled => 0,
            PoolMode::Pooled { text, .. } => {
                text.lock().expect("text pool mutex poisoned").total_capacity
            }
        }
    }
}

impl std::fmt::Debug for BufferAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferAllocator")
            .field("closed", &self.is_closed())
            .field(
                "pooled",
                &matches!(self.inner.mode, PoolMode::Pooled { .. }),
            )
            .finish()
    }
}

impl AllocatorInner {
    fn release_bytes(&self, data: Box<[u8]>) {
        let capacity = data.len();
        if let PoolMode::Pooled { bytes, .. } = &self.mode {
            if !self.closed.load(Ordering::Relaxed)
                && capacity <= self.options.max_pooled_byte_buffer_capacity
            {
                let mut pool = bytes.lock().expect("byte pool mutex poisoned");
                if pool.total_capacity + capacity <= self.options.max_byte_buffer_pool_capacity {
                    pool.put(capacity, data);
                    self.counters.byte_buffers_pooled.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        }
        trace!(capacity, "discarding byte buffer");
        self.counters
            .byte_buffers_discarded
            .fetch_add(1, Ordering::Relaxed);
    }

    fn release_text(&self, data: String) {
        let capacity = data.capacity();
        if let PoolMode::Pooled { text, .. } = &self.mode {
            if !self.closed.load(Ordering::Relaxed)
                && capacity <= self.options.max_pooled_text_buffer_capacity
            {
                let mut pool = text.lock().expect("text pool mutex poisoned");
                if pool.total_capacity + capacity <= self.options.max_text_buffer_pool_capacity {
                    pool.put(capacity, data);
                    self.counters.text_buffers_pooled.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        }
        trace!(capacity, "discarding text buffer");
        self.counters
            .text_buffers_discarded
            .fetch_add(1, Ordering::Relaxed);
    }
}

/// Byte buffer leased from a [`BufferAllocator`].
///
/// The backing storage returns to the allocator when the lease drops.
pub struct Buffer {
    data: Option<Box<[u8]>>,
    owner: Arc<AllocatorInner>,
}

impl Buffer {
    /// Backing capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.as_ref().map_or(0, |data| data.len())
    }

    /// The full backing storage as an immutable slice.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.data.as_ref().expect("buffer already released")
    }

    /// The full backing storage as a mutable slice.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data.as_mut().expect("buffer already released")
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.owner.release_bytes(data);
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Text buffer leased from a [`BufferAllocator`].
///
/// Used as a decode scratch target; the backing `String` returns to the
/// allocator when the lease drops.
pub struct TextBuffer {
    data: Option<String>,
    owner: Arc<AllocatorInner>,
}

impl TextBuffer {
    /// Backing capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.as_ref().map_or(0, String::capacity)
    }

    /// Current contents.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.data.as_ref().expect("text buffer already released")
    }

    /// Mutable access to the backing `String` for appends.
    pub fn as_mut_string(&mut self) -> &mut String {
        self.data.as_mut().expect("text buffer already released")
    }
}

impl Drop for TextBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.owner.release_text(data);
        }
    }
}

impl std::fmt::Debug for TextBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextBuffer")
            .field("capacity", &self.capacity())
            .field("len", &self.as_str().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_rounds_to_power_of_two() {
        let allocator = BufferAllocator::unpooled();
        let buffer = allocator.acquire_bytes(9).unwrap();
        assert_eq!(buffer.capacity(), 16);
        let buffer = allocator.acquire_bytes(8192).unwrap();
        assert_eq!(buffer.capacity(), 8192);
    }

    #[test]
    fn test_pooled_reuse_smallest_fit() {
        let allocator = BufferAllocator::pooled(AllocatorOptions::default());
        let small = allocator.acquire_bytes(100).unwrap();
        let large = allocator.acquire_bytes(5000).unwrap();
        drop(small);
        drop(large);

        // A 60-byte request fits the released 128-byte block, not the 8192.
        let reused = allocator.acquire_bytes(60).unwrap();
        assert_eq!(reused.capacity(), 128);

        let stats = allocator.stats();
        assert_eq!(stats.byte_acquires, 3);
        assert_eq!(stats.byte_pool_hits, 1);
        assert_eq!(stats.byte_buffers_pooled, 2);
    }

    #[test]
    fn test_unpooled_never_retains() {
        let allocator = BufferAllocator::unpooled();
        drop(allocator.acquire_bytes(64).unwrap());
        assert_eq!(allocator.pooled_byte_capacity(), 0);
        let stats = allocator.stats();
        assert_eq!(stats.byte_buffers_discarded, 1);
        assert_eq!(stats.byte_buffers_pooled, 0);
    }

    #[test]
    fn test_acquire_cap_enforced() {
        let options = AllocatorOptions {
            max_byte_buffer_capacity: 1024,
            ..AllocatorOptions::default()
        };
        let allocator = BufferAllocator::pooled(options);
        assert!(allocator.acquire_bytes(1024).is_ok());
        assert!(matches!(
            allocator.acquire_bytes(1025),
            Err(Error::CapacityExceeded {
                requested: 1025,
                max: 1024
            })
        ));
    }

    #[test]
    fn test_per_buffer_pooling_cap() {
        let options = AllocatorOptions {
            max_pooled_byte_buffer_capacity: 256,
            ..AllocatorOptions::default()
        };
        let allocator = BufferAllocator::pooled(options);
        drop(allocator.acquire_bytes(512).unwrap());
        assert_eq!(allocator.pooled_byte_capacity(), 0);
        drop(allocator.acquire_bytes(256).unwrap());
        assert_eq!(allocator.pooled_byte_capacity(), 256);
    }

    #[test]
    fn test_pool_total_cap_never_exceeded() {
        let options = AllocatorOptions {
            max_byte_buffer_pool_capacity: 1024,
            ..AllocatorOptions::default()
        };
        let allocator = BufferAllocator::pooled(options);
        let leases: Vec<_> = (0..4)
            .map(|_| allocator.acquire_bytes(512).unwrap())
            .collect();
        for lease in leases {
            drop(lease);
            assert!(allocator.pooled_byte_capacity() <= 1024);
        }
        assert_eq!(allocator.pooled_byte_capacity(), 1024);
        assert_eq!(allocator.stats().byte_buffers_discarded, 2);
    }

    #[test]
    fn test_close_drops_pool_and_fails_acquires() {
        let allocator = BufferAllocator::pooled(AllocatorOptions::default());
        drop(allocator.acquire_bytes(128).unwrap());
        assert!(allocator.pooled_byte_capacity() > 0);

        allocator.close();
        assert_eq!(allocator.pooled_byte_capacity(), 0);
        assert!(matches!(
            allocator.acquire_bytes(128),
            Err(Error::AllocatorClosed)
        ));
        assert!(matches!(allocator.acquire_text(16), Err(Error::AllocatorClosed)));
    }

    #[test]
    fn test_text_pool_roundtrip() {
        let allocator = BufferAllocator::pooled(AllocatorOptions::default());
        let mut text = allocator.acquire_text(32).unwrap();
        text.as_mut_string().push_str("hello");
        assert_eq!(text.as_str(), "hello");
        drop(text);

        let reused = allocator.acquire_text(16).unwrap();
        assert_eq!(reused.as_str(), "");
        assert_eq!(allocator.stats().text_pool_hits, 1);
    }
}
