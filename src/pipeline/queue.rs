//! Bounded FIFO hand-off between the device callback and the consumer thread

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::capture::FrameBuffer;
use crate::pipeline::pool::FramePool;

/// Frames allowed in flight between producer and consumer.
pub const MAX_FRAME: usize = 4;

struct QueueState {
    frames: VecDeque<FrameBuffer>,
    running: bool,
}

/// Frame queue. The run flag lives under the queue lock so a cleared flag
/// can never race past a waiting consumer.
pub struct FrameQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity),
                running: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Producer side. Hands the buffer back when stopped or full; the caller
    /// must release it to the pool.
    pub fn push(&self, buf: FrameBuffer) -> Result<(), FrameBuffer> {
        let mut state = self.lock();
        if !state.running || state.frames.len() >= self.capacity {
            return Err(buf);
        }
        state.frames.push_back(buf);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Consumer side. Blocks until a frame arrives or the run flag clears.
    pub fn pop(&self) -> Option<FrameBuffer> {
        let state = self.lock();
        let mut state = self
            .available
            .wait_while(state, |s| s.running && s.frames.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        if state.running {
            state.frames.pop_front()
        } else {
            None
        }
    }

    /// Set the run flag and wake every waiter so they re-check it.
    pub fn set_running(&self, running: bool) {
        self.lock().running = running;
        self.available.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Release every queued buffer back to `pool`.
    pub fn drain(&self, pool: &FramePool) -> usize {
        let drained: Vec<_> = self.lock().frames.drain(..).collect();
        let count = drained.len();
        for buf in drained {
            pool.release(buf);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new(MAX_FRAME)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;

    /// `pop` that gives up after `timeout`, so a stalled test fails instead of hanging.
    fn pop_timeout(queue: &FrameQueue, timeout: Duration) -> Option<FrameBuffer> {
        let deadline = Instant::now() + timeout;
        let mut state = queue.lock();
        while state.running && state.frames.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            state = queue
                .available
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        if state.running {
            state.frames.pop_front()
        } else {
            None
        }
    }

    fn tagged(pool: &FramePool, sequence: u64) -> FrameBuffer {
        let mut buf = pool.acquire(8);
        buf.sequence = sequence;
        buf
    }

    #[test]
    fn test_push_rejected_when_stopped() {
        let pool = FramePool::new(4);
        let queue = FrameQueue::new(4);
        let rejected = queue.push(tagged(&pool, 1)).unwrap_err();
        assert_eq!(rejected.sequence, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_rejected_when_full() {
        let pool = FramePool::new(8);
        let queue = FrameQueue::new(2);
        queue.set_running(true);

        assert!(queue.push(tagged(&pool, 1)).is_ok());
        assert!(queue.push(tagged(&pool, 2)).is_ok());
        let rejected = queue.push(tagged(&pool, 3)).unwrap_err();
        assert_eq!(rejected.sequence, 3);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_fifo_order() {
        let pool = FramePool::new(8);
        let queue = FrameQueue::new(4);
        queue.set_running(true);

        for seq in 0..4 {
            queue.push(tagged(&pool, seq)).unwrap();
        }
        for seq in 0..4 {
            assert_eq!(queue.pop().unwrap().sequence, seq);
        }
    }

    #[test]
    fn test_pop_returns_none_once_stopped() {
        let queue = Arc::new(FrameQueue::new(4));
        queue.set_running(true);

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.set_running(false);
        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn test_pop_wakes_on_push() {
        let pool = FramePool::new(4);
        let queue = Arc::new(FrameQueue::new(4));
        queue.set_running(true);

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop().map(|buf| buf.sequence))
        };
        thread::sleep(Duration::from_millis(20));
        queue.push(tagged(&pool, 7)).unwrap();
        assert_eq!(consumer.join().unwrap(), Some(7));
    }

    #[test]
    fn test_drain_releases_to_pool() {
        let pool = FramePool::new(4);
        let queue = FrameQueue::new(4);
        queue.set_running(true);
        queue.push(tagged(&pool, 1)).unwrap();
        queue.push(tagged(&pool, 2)).unwrap();

        assert_eq!(queue.drain(&pool), 2);
        assert!(queue.is_empty());
        assert_eq!(pool.idle_len(), 2);
    }

    #[test]
    fn test_threaded_delivery_in_order_without_duplicates() {
        let pool = Arc::new(FramePool::new(8));
        let queue = Arc::new(FrameQueue::new(4));
        queue.set_running(true);

        let producer = {
            let pool = pool.clone();
            let queue = queue.clone();
            thread::spawn(move || {
                let mut pushed = Vec::new();
                for seq in 0..500u64 {
                    match queue.push(tagged(&pool, seq)) {
                        Ok(()) => pushed.push(seq),
                        Err(buf) => pool.release(buf),
                    }
                    if seq % 16 == 0 {
                        thread::yield_now();
                    }
                }
                pushed
            })
        };

        let mut delivered = Vec::new();
        loop {
            match pop_timeout(&queue, Duration::from_millis(200)) {
                Some(buf) => {
                    delivered.push(buf.sequence);
                    pool.release(buf);
                }
                None => break,
            }
        }

        let pushed = producer.join().unwrap();
        assert_eq!(delivered, pushed);
    }
}
