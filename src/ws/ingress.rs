//! Ingress ring buffer sitting between a connection's raw broadcast and the
//! transport's dispatch loop, with an explicit overflow policy instead of an
//! unbounded queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;

/// A bounded queue of raw frames. Once full, the oldest frame is evicted to
/// make room for the newest one rather than blocking the producer or
/// rejecting the new frame outright.
pub struct IngressBuffer {
    capacity: usize,
    queue: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl IngressBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Pushes a frame, evicting the oldest one first if already at capacity.
    /// Returns `true` if an eviction occurred.
    pub fn push(&self, frame: Vec<u8>) -> bool {
        let mut evicted = false;
        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.len() >= self.capacity {
                queue.pop_front();
                evicted = true;
            }
            queue.push_back(frame);
        }
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    /// Pops the oldest frame, waiting if the buffer is currently empty.
    pub async fn pop(&self) -> Vec<u8> {
        loop {
            if let Some(frame) = self
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
            {
                return frame;
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking pop, for callers that poll rather than await.
    pub fn try_pop(&self) -> Option<Vec<u8>> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fraction of capacity currently occupied, in `[0, 1]`.
    #[must_use]
    pub fn usage_pct(&self) -> f64 {
        (self.len() as f64 / self.capacity as f64) * 100.0
    }

    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_beyond_capacity_drops_oldest() {
        let buf = IngressBuffer::new(2);
        assert!(!buf.push(vec![1]));
        assert!(!buf.push(vec![2]));
        assert!(buf.push(vec![3]));
        assert_eq!(buf.try_pop(), Some(vec![2]));
        assert_eq!(buf.try_pop(), Some(vec![3]));
        assert_eq!(buf.dropped_count(), 1);
    }

    #[test]
    fn usage_pct_reflects_occupancy() {
        let buf = IngressBuffer::new(4);
        buf.push(vec![1]);
        buf.push(vec![2]);
        assert!((buf.usage_pct() - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn pop_waits_for_a_push() {
        let buf = std::sync::Arc::new(IngressBuffer::new(4));
        let buf_clone = std::sync::Arc::clone(&buf);
        let handle = tokio::spawn(async move { buf_clone.pop().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        buf.push(vec![9]);
        assert_eq!(handle.await.unwrap(), vec![9]);
    }
}
