//! New-endpoint queue
//!
//! Bounded FIFO of endpoint names waiting to be registered with a registry
//! peer. Producers push to the front, the registration loop pops from the
//! back. When full, the oldest names are dropped; an endpoint that is still
//! unreported gets queued again on the next rebuild.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 100_000;

/// Thread-safe bounded FIFO with drop-oldest overflow
#[derive(Debug)]
pub struct NewEndpointQueue {
    items: Mutex<VecDeque<String>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl NewEndpointQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a name; returns false when an older name had to be dropped
    pub fn push_front(&self, endpoint: impl Into<String>) -> bool {
        let mut items = self.items.lock();
        let mut kept_all = true;

        while items.len() >= self.capacity {
            items.pop_back();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            kept_all = false;
        }

        items.push_front(endpoint.into());
        kept_all
    }

    /// Dequeue up to `max` of the oldest names
    pub fn pop_back_batch(&self, max: usize) -> Vec<String> {
        let mut items = self.items.lock();
        let n = max.min(items.len());
        let mut batch = Vec::with_capacity(n);
        for _ in 0..n {
            if let Some(endpoint) = items.pop_back() {
                batch.push(endpoint);
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Names discarded on overflow since startup
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for NewEndpointQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let queue = NewEndpointQueue::new(10);
        queue.push_front("a");
        queue.push_front("b");
        queue.push_front("c");

        assert_eq!(queue.pop_back_batch(2), vec!["a", "b"]);
        assert_eq!(queue.pop_back_batch(5), vec!["c"]);
        assert!(queue.pop_back_batch(5).is_empty());
    }

    #[test]
    fn test_drop_oldest_on_overflow() {
        let queue = NewEndpointQueue::new(3);
        assert!(queue.push_front("a"));
        assert!(queue.push_front("b"));
        assert!(queue.push_front("c"));
        assert!(!queue.push_front("d"));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop_back_batch(10), vec!["b", "c", "d"]);
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = Arc::new(NewEndpointQueue::new(100_000));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        queue.push_front(format!("ep-{}-{}", t, i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(queue.len(), 8000);
        assert_eq!(queue.dropped(), 0);
    }
}
