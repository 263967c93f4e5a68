//! Bounded hand-off queue between one media producer and its consumer.
//!
//! Pushing never blocks: when the queue is full the oldest chunk is dropped,
//! so a stalled consumer costs latency-bounded audio loss instead of memory.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Bounded FIFO of media chunks with oldest-drop overflow
pub struct MediaQueue {
    name: &'static str,
    capacity: usize,
    chunks: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl MediaQueue {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            chunks: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a chunk and wake the consumer
    pub fn push(&self, chunk: Bytes) {
        let evicted = {
            let mut chunks = self.chunks.lock();
            let evicted = if chunks.len() >= self.capacity {
                chunks.pop_front()
            } else {
                None
            };
            chunks.push_back(chunk);
            evicted
        };

        if evicted.is_some() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                tracing::warn!(
                    "{} queue full (capacity {}), {} chunks dropped so far",
                    self.name,
                    self.capacity,
                    dropped
                );
            }
        }

        self.notify.notify_one();
    }

    /// Dequeue without waiting
    pub fn try_pop(&self) -> Option<Bytes> {
        self.chunks.lock().pop_front()
    }

    /// Dequeue, waiting until a chunk is available. Single consumer.
    pub async fn pop(&self) -> Bytes {
        loop {
            if let Some(chunk) = self.try_pop() {
                return chunk;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of chunks evicted on overflow
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
