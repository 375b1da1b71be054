//! Reusable byte buffers for response encoding.

use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

/// Default number of idle buffers kept around.
pub const DEFAULT_MAX_IDLE: usize = 16;

/// Buffers that grew past this capacity are dropped instead of pooled.
pub const DEFAULT_MAX_CAPACITY: usize = 4 * 1024 * 1024;

/// Thread-safe pool of byte buffers shared by all scrape requests.
///
/// Encoding writes into a pooled buffer that has already grown to the size
/// of earlier scrapes. The response body is a single exact-size copy made
/// once encoding is done, so the pool saves the repeated growth
/// reallocations, not that final copy.
///
/// The lock is only held to pop or push a buffer, never while a buffer is
/// in use, so concurrent scrapes do not serialize on it.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_idle: usize,
    max_capacity: usize,
}

impl BufferPool {
    /// Create a pool with the default limits.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_IDLE, DEFAULT_MAX_CAPACITY)
    }

    /// Create a pool keeping at most `max_idle` buffers of at most
    /// `max_capacity` bytes each.
    pub fn with_limits(max_idle: usize, max_capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
            max_capacity,
        }
    }

    /// Take an empty buffer from the pool, allocating if none is idle.
    ///
    /// The buffer goes back to the pool when the guard is dropped.
    pub fn get(&self) -> PooledBuffer<'_> {
        let buf = self.free.lock().pop().unwrap_or_default();
        PooledBuffer { pool: self, buf }
    }

    /// Number of idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() == 0 || buf.capacity() > self.max_capacity {
            return;
        }
        buf.clear();

        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A buffer borrowed from a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: Vec<u8>,
}

impl Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}
