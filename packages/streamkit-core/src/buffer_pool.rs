//! Recyclable byte-buffer allocator (spec §4.1, component C2).
//!
//! Capture sources and encoders churn through many same-sized buffers per
//! second; reallocating each one would thrash the system allocator. The pool
//! buckets buffers into power-of-two "capacity classes" and keeps a bounded
//! free list per class, falling back to the system allocator (via
//! [`bytes::BytesMut`]) whenever a class's free list is empty or full.

use std::collections::HashMap;

use bytes::BytesMut;
use parking_lot::Mutex;

/// A pooled buffer. Returned to its pool on [`BufferPool::put`]; dropping it
/// without returning it simply deallocates (no leak, no panic).
pub struct Buffer {
    data: BytesMut,
    class: usize,
}

impl Buffer {
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The capacity class (a power of two) this buffer was allocated from.
    pub fn class(&self) -> usize {
        self.class
    }
}

/// Tuning knobs for [`BufferPool`].
#[derive(Debug, Clone, Copy)]
pub struct BufferPoolConfig {
    /// Maximum number of idle buffers retained per capacity class. Buffers
    /// returned beyond this cap are dropped (soft cap, spec §4.1).
    pub max_idle_per_class: usize,
    /// Smallest capacity class the pool hands out, to avoid a proliferation
    /// of tiny classes for small control buffers.
    pub min_class_bytes: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_class: 8,
            min_class_bytes: 4096,
        }
    }
}

/// A capacity-class-keyed recyclable buffer allocator.
pub struct BufferPool {
    config: BufferPoolConfig,
    classes: Mutex<HashMap<usize, Vec<BytesMut>>>,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig) -> Self {
        Self {
            config,
            classes: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a buffer holding at least `size` bytes, zero-filled.
    ///
    /// Reuses an idle buffer from the matching capacity class when one is
    /// available, else allocates a fresh one from the system allocator.
    pub fn get(&self, size: usize) -> Buffer {
        let class = Self::class_for(size, self.config.min_class_bytes);
        let mut data = {
            let mut classes = self.classes.lock();
            classes
                .get_mut(&class)
                .and_then(|free| free.pop())
                .unwrap_or_else(|| BytesMut::with_capacity(class))
        };
        data.clear();
        data.resize(size, 0);
        Buffer { data, class }
    }

    /// Returns a buffer to its capacity class's free list, unless that list
    /// is already at [`BufferPoolConfig::max_idle_per_class`] (soft cap — the
    /// buffer is simply dropped, falling back to the system allocator).
    pub fn put(&self, buffer: Buffer) {
        let mut classes = self.classes.lock();
        let free = classes.entry(buffer.class).or_default();
        if free.len() < self.config.max_idle_per_class {
            free.push(buffer.data);
        }
    }

    /// Total idle buffers retained across all capacity classes (test/metrics hook).
    pub fn idle_count(&self) -> usize {
        self.classes.lock().values().map(Vec::len).sum()
    }

    fn class_for(size: usize, min_class_bytes: usize) -> usize {
        size.max(min_class_bytes).next_power_of_two()
    }
}
