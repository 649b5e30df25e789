//! Recycled frame buffers for the pipe backend
//!
//! A buffer is in one of three places: checked out by a producer, pending in
//! the writer queue, or available for reuse. The pool only counts; the buffer
//! itself moves by value, so two frames can never share one.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Snapshot of where a pool's buffers are
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Buffers ever allocated
    pub allocated: usize,
    /// Ready for reuse
    pub available: usize,
    /// Queued for the writer
    pub pending: usize,
    /// Held by a producer or the writer
    pub in_flight: usize,
}

pub struct BufferPool<T> {
    available: Mutex<Vec<Vec<T>>>,
    allocated: AtomicUsize,
    pending: AtomicUsize,
}

impl<T: Clone + Default> BufferPool<T> {
    pub fn new() -> Self {
        Self {
            available: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
        }
    }

    /// Get a buffer of exactly `len` elements, reusing one if possible.
    ///
    /// Contents are unspecified; producers overwrite the whole buffer.
    pub fn checkout(&self, len: usize) -> Vec<T> {
        let recycled = self.available.lock().pop();
        let mut buf = match recycled {
            Some(buf) => buf,
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(len)
            }
        };
        buf.resize(len, T::default());
        buf
    }

    /// A checked-out buffer was handed to the writer queue
    pub fn mark_pending(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// The writer is done with a pending buffer
    pub fn complete(&self, buf: Vec<T>) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        self.available.lock().push(buf);
    }

    /// A checked-out buffer was never queued
    pub fn release(&self, buf: Vec<T>) {
        self.available.lock().push(buf);
    }

    pub fn stats(&self) -> PoolStats {
        let available = self.available.lock().len();
        let allocated = self.allocated.load(Ordering::Relaxed);
        let pending = self.pending.load(Ordering::Acquire);
        PoolStats {
            allocated,
            available,
            pending,
            in_flight: allocated.saturating_sub(available + pending),
        }
    }
}

impl<T: Clone + Default> Default for BufferPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_are_reused() {
        let pool = BufferPool::<u8>::new();
        let buf = pool.checkout(16);
        assert_eq!(buf.len(), 16);
        pool.mark_pending();
        pool.complete(buf);

        let again = pool.checkout(8);
        assert_eq!(again.len(), 8);
        assert!(again.capacity() >= 16);
        assert_eq!(pool.stats().allocated, 1);
    }

    #[test]
    fn test_every_buffer_accounted_for() {
        let pool = BufferPool::<f32>::new();
        let a = pool.checkout(4);
        let b = pool.checkout(4);
        let c = pool.checkout(4);
        pool.mark_pending();
        pool.mark_pending();

        let stats = pool.stats();
        assert_eq!(stats.allocated, 3);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.in_flight, 1);

        pool.complete(a);
        pool.complete(b);
        pool.release(c);
        let stats = pool.stats();
        assert_eq!(stats.available, 3);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.in_flight, 0);
    }
}
