//! A reusable pool of outgoing-frame scratch buffers: borrow a cleared
//! `Vec<u8>`, encode a frame into it, hand it to the writer task, and it
//! returns itself to the pool once the write completes and the guard
//! drops. Unlike the stream-id pool and the host connection pool, this
//! has no ordering or per-item state to track - any free buffer does -
//! so `ArrayQueue` is a direct fit rather than the `Mutex<Vec<_>>` those
//! need.

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug)]
pub struct FrameBufferPool {
    buffers: ArrayQueue<Vec<u8>>,
}

impl FrameBufferPool {
    pub fn new(capacity: usize) -> Self {
        Self { buffers: ArrayQueue::new(capacity) }
    }

    /// Borrow a cleared buffer, allocating a fresh one if the pool is
    /// currently empty.
    pub fn take(self: &Arc<Self>) -> PooledBuffer {
        let buf = self.buffers.pop().unwrap_or_default();
        PooledBuffer { pool: Arc::clone(self), inner: ManuallyDrop::new(buf) }
    }
}

impl Default for FrameBufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A pooled `Vec<u8>` that clears and returns itself to the pool on drop.
/// Dropping while the pool is already at capacity just discards it.
pub struct PooledBuffer {
    pool: Arc<FrameBufferPool>,
    inner: ManuallyDrop<Vec<u8>>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        // SAFETY: `inner` is not read again after this take - the
        // `ManuallyDrop` wrapper only exists to let us move the `Vec` out
        // of a `&mut self` receiver in `drop`.
        let mut vec = unsafe { ManuallyDrop::take(&mut self.inner) };
        vec.clear();
        let _ = self.pool.buffers.push(vec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_a_returned_buffer_instead_of_allocating() {
        let pool = Arc::new(FrameBufferPool::new(4));
        let ptr = {
            let mut buf = pool.take();
            buf.extend_from_slice(b"hello");
            buf.as_ptr()
        };
        let buf = pool.take();
        assert!(buf.is_empty());
        assert_eq!(buf.as_ptr(), ptr);
    }

    #[test]
    fn discards_past_capacity_without_panicking() {
        let pool = Arc::new(FrameBufferPool::new(1));
        let a = pool.take();
        let b = pool.take();
        drop(a);
        drop(b);
        assert!(pool.buffers.len() <= 1);
    }
}
