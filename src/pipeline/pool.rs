//! Capacity-bounded reuse cache for frame buffers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, trace};

use crate::capture::FrameBuffer;

/// Idle buffers kept for reuse: a full queue plus one buffer on each side.
pub const FRAME_POOL_SIZE: usize = 6;

/// Pool of idle frame buffers.
///
/// Buffers are handed out by value, so a buffer is either idle here or
/// owned by exactly one caller. Reuse is LIFO to keep the hottest buffer
/// in cache.
pub struct FramePool {
    idle: Mutex<Vec<FrameBuffer>>,
    capacity: usize,
    allocated: AtomicUsize,
    freed: AtomicUsize,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            allocated: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
        }
    }

    /// Take an idle buffer with room for `size` bytes, allocating if none is idle.
    pub fn acquire(&self, size: usize) -> FrameBuffer {
        let recycled = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        match recycled {
            Some(mut buf) => {
                buf.reserve(size);
                buf
            }
            None => {
                let n = self.allocated.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(size, allocated = n, "allocating frame buffer");
                metrics::counter!("frame_buffers_allocated").increment(1);
                FrameBuffer::with_capacity(size)
            }
        }
    }

    /// Hand a buffer back. Frees it when the pool is already full.
    pub fn release(&self, mut buf: FrameBuffer) {
        buf.reset();
        let overflow = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            if idle.len() < self.capacity {
                idle.push(buf);
                None
            } else {
                Some(buf)
            }
        };
        // free outside the lock
        if overflow.is_some() {
            self.freed.fetch_add(1, Ordering::Relaxed);
            drop(overflow);
        }
    }

    /// Free every idle buffer. Producer and consumer must be quiescent.
    pub fn drain(&self) {
        let drained = std::mem::take(&mut *self.idle.lock().unwrap_or_else(PoisonError::into_inner));
        if !drained.is_empty() {
            debug!(count = drained.len(), "draining frame pool");
        }
        self.freed.fetch_add(drained.len(), Ordering::Relaxed);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Buffers allocated over the pool's lifetime
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Buffers allocated and not yet freed: idle plus in flight
    pub fn live(&self) -> usize {
        self.allocated() - self.freed.load(Ordering::Relaxed)
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new(FRAME_POOL_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_allocates_when_empty() {
        let pool = FramePool::new(2);
        let buf = pool.acquire(1024);
        assert!(buf.capacity() >= 1024);
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.idle_len(), 0);
    }

    #[test]
    fn test_release_recycles() {
        let pool = FramePool::new(2);
        let buf = pool.acquire(64);
        pool.release(buf);
        assert_eq!(pool.idle_len(), 1);

        let buf = pool.acquire(64);
        assert_eq!(pool.allocated(), 1);
        assert!(buf.is_empty());
        pool.release(buf);
    }

    #[test]
    fn test_recycled_buffer_grows_to_request() {
        let pool = FramePool::new(1);
        pool.release(pool.acquire(16));
        let buf = pool.acquire(4096);
        assert!(buf.capacity() >= 4096);
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn test_release_over_capacity_frees() {
        let pool = FramePool::new(2);
        let bufs: Vec<_> = (0..5).map(|_| pool.acquire(32)).collect();
        assert_eq!(pool.live(), 5);

        for buf in bufs {
            pool.release(buf);
            assert!(pool.idle_len() <= pool.capacity());
        }
        assert_eq!(pool.idle_len(), 2);
        assert_eq!(pool.live(), 2);
    }

    #[test]
    fn test_live_bounded_by_capacity_plus_in_use() {
        let pool = FramePool::new(3);
        for round in 0..10 {
            let in_use: Vec<_> = (0..(round % 5) + 1).map(|_| pool.acquire(8)).collect();
            assert!(pool.live() <= pool.capacity() + in_use.len());
            for buf in in_use {
                pool.release(buf);
            }
            assert!(pool.idle_len() <= pool.capacity());
        }
    }

    #[test]
    fn test_drain_frees_idle() {
        let pool = FramePool::new(4);
        let a = pool.acquire(8);
        let b = pool.acquire(8);
        pool.release(a);
        pool.release(b);
        pool.drain();
        assert_eq!(pool.idle_len(), 0);
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn test_concurrent_release() {
        use std::sync::Arc;

        let pool = Arc::new(FramePool::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let buf = pool.acquire(128);
                        pool.release(buf);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(pool.idle_len() <= 4);
        assert_eq!(pool.live(), pool.idle_len());
    }
}
