//! Shared pool of fixed-size copy buffers.
//!
//! Each copy loop checks out one buffer and hands it back when the guard is
//! dropped, so memory stays bounded under many concurrent tunnels and a buffer
//! is never used by two loops at once.

use crossbeam_queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Size of each copy buffer.
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Number of idle buffers retained by default.
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct BufferPool {
    buffers: ArrayQueue<Box<[u8]>>,
    buffer_size: usize,
    allocations: AtomicU64,
    reuses: AtomicU64,
}

impl BufferPool {
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(capacity.max(1)),
            buffer_size,
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY, COPY_BUFFER_SIZE)
    }

    /// Checks out a buffer, allocating one if the pool is empty.
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buffer = match self.buffers.pop() {
            Some(buf) => {
                self.reuses.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.buffer_size].into_boxed_slice()
            }
        };

        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(self),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Buffers currently idle in the pool.
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    fn put(&self, buffer: Box<[u8]>) {
        // Full pool: let the buffer go.
        let _ = self.buffers.push(buffer);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Buffer checked out of a [`BufferPool`]; returned to the pool on drop.
pub struct PooledBuffer {
    buffer: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.put(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_has_configured_size() {
        let pool = Arc::new(BufferPool::with_defaults());
        let buf = pool.get();
        assert_eq!(buf.len(), COPY_BUFFER_SIZE);
    }

    #[test]
    fn test_buffer_returned_on_drop() {
        let pool = Arc::new(BufferPool::new(4, 16));
        {
            let _a = pool.get();
            let _b = pool.get();
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.allocations(), 2);

        let _c = pool.get();
        assert_eq!(pool.reuses(), 1);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_full_pool_drops_extra_buffers() {
        let pool = Arc::new(BufferPool::new(1, 8));
        let a = pool.get();
        let b = pool.get();
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_concurrent_checkouts_are_distinct() {
        let pool = Arc::new(BufferPool::new(2, 8));
        let mut a = pool.get();
        let mut b = pool.get();
        a[0] = 1;
        b[0] = 2;
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_eq!(a[0], 1);
        assert_eq!(b[0], 2);
    }
}
