//! Bounded concurrent queues for cross-thread event handoff
//!
//! The four queues of a session (connections, disconnections, incoming
//! packets, outgoing sends) are the only state shared between the
//! application thread and the network thread. They are fixed-capacity
//! and fail fast on overflow: producers never block, the network thread
//! never stalls behind a slow consumer.

use crossbeam::queue::ArrayQueue;

/// Fixed-capacity FIFO queue safe for concurrent producers.
///
/// `push` is callable from any thread and rejects the item when the
/// queue is full; `try_pop` is non-blocking; `drain` discards all
/// current contents (used when a session restarts, so a new network
/// thread never sees stale entries from a previous run).
#[derive(Debug)]
pub struct EventQueue<T> {
    inner: ArrayQueue<T>,
}

impl<T> EventQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        EventQueue {
            inner: ArrayQueue::new(capacity),
        }
    }

    /// Append an item, failing fast when the queue is full.
    ///
    /// On overflow the item is handed back to the caller, who decides
    /// whether to count, log or drop it. Never blocks.
    pub fn push(&self, item: T) -> Result<(), T> {
        self.inner.push(item)
    }

    /// Remove and return the oldest item, or `None` when empty.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.pop()
    }

    /// Discard all current contents without processing them.
    pub fn drain(&self) {
        while self.inner.pop().is_some() {}
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True when no items are queued.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Fixed capacity chosen at construction.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let queue = EventQueue::new(64);
        for i in 0..64 {
            queue.push(i).unwrap();
        }
        for i in 0..64 {
            assert_eq!(queue.try_pop(), Some(i));
        }
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_push_full_rejects() {
        let queue = EventQueue::new(2);
        queue.push("a").unwrap();
        queue.push("b").unwrap();
        assert_eq!(queue.push("c"), Err("c"));
        // rejection leaves existing contents untouched
        assert_eq!(queue.try_pop(), Some("a"));
        assert_eq!(queue.try_pop(), Some("b"));
    }

    #[test]
    fn test_drain_empties_queue() {
        let queue = EventQueue::new(16);
        for i in 0..10 {
            queue.push(i).unwrap();
        }
        queue.drain();
        assert!(queue.is_empty());
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_drain_empty_is_noop() {
        let queue: EventQueue<u8> = EventQueue::new(4);
        queue.drain();
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_capacity_reported() {
        let queue: EventQueue<u8> = EventQueue::new(128);
        assert_eq!(queue.capacity(), 128);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_concurrent_producers_preserve_count() {
        let queue = Arc::new(EventQueue::new(1000));
        let mut handles = Vec::new();

        for t in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    queue.push((t, i)).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.len(), 400);

        // per-producer order is preserved even though producers interleave
        let mut last_seen = [None; 4];
        while let Some((t, i)) = queue.try_pop() {
            if let Some(prev) = last_seen[t] {
                assert!(i > prev, "producer {t} reordered: {i} after {prev}");
            }
            last_seen[t] = Some(i);
        }
    }
}
