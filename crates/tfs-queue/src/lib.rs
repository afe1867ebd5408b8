#![forbid(unsafe_code)]
//! Thread-safe blocking FIFO shared by the cache subsystems.
//!
//! [`BlockingQueue`] is the one queue primitive the cache uses, with
//! three payload types: recyclable file-slot indices, write-back job
//! descriptors, and per-file write-error records.
//!
//! Design:
//! - `push` never blocks; a bounded queue at capacity rejects the item
//!   and hands it back.
//! - `pop` blocks until an item arrives or the queue is closed **and**
//!   drained; remaining items are still delivered after `close`, so a
//!   consumer can finish queued work during teardown.
//! - Multiple producers and multiple consumers operate through
//!   `&self`. FIFO holds per producer; cross-producer interleaving is
//!   whatever the lock hands out.
//!
//! Lock poisoning is absorbed with `PoisonError::into_inner`: a
//! panicking producer must not wedge every consumer.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Why a `push` was rejected. The item is handed back in either case.
#[derive(Debug, PartialEq, Eq)]
pub enum PushError<T> {
    /// Bounded queue is at capacity.
    Full(T),
    /// The queue has been closed.
    Closed(T),
}

impl<T> PushError<T> {
    /// Recover the rejected item.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Closed(item) => item,
        }
    }
}

impl<T> std::fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full(_) => write!(f, "queue is full"),
            Self::Closed(_) => write!(f, "queue is closed"),
        }
    }
}

#[derive(Debug)]
struct Shared<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Multi-producer multi-consumer FIFO with blocking and non-blocking
/// pop, optionally bounded.
#[derive(Debug)]
pub struct BlockingQueue<T> {
    shared: Mutex<Shared<T>>,
    not_empty: Condvar,
    capacity: Option<usize>,
}

impl<T> BlockingQueue<T> {
    /// Create a queue with no capacity limit.
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            shared: Mutex::new(Shared {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            capacity: None,
        }
    }

    /// Create a queue that holds at most `capacity` items.
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        Self {
            shared: Mutex::new(Shared {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            capacity: Some(capacity),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared<T>> {
        self.shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Append an item. Never blocks.
    ///
    /// Returns the item inside [`PushError`] if the queue is closed or
    /// a bounded queue is at capacity.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let mut shared = self.lock();
        if shared.closed {
            return Err(PushError::Closed(item));
        }
        if let Some(capacity) = self.capacity {
            if shared.items.len() >= capacity {
                return Err(PushError::Full(item));
            }
        }
        shared.items.push_back(item);
        drop(shared);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove the oldest item, blocking until one is available.
    ///
    /// Returns `None` only once the queue is closed and every
    /// previously pushed item has been delivered.
    pub fn pop(&self) -> Option<T> {
        let mut shared = self.lock();
        loop {
            if let Some(item) = shared.items.pop_front() {
                return Some(item);
            }
            if shared.closed {
                return None;
            }
            shared = self
                .not_empty
                .wait(shared)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Remove the oldest item without blocking. `None` means the queue
    /// is empty right now (closed or not).
    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Like [`pop`](Self::pop), but gives up after `timeout`.
    ///
    /// Returns `None` on timeout or on closed-and-drained.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut shared = self.lock();
        loop {
            if let Some(item) = shared.items.pop_front() {
                return Some(item);
            }
            if shared.closed {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (new_shared, timeout_result) = self
                .not_empty
                .wait_timeout(shared, remaining)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            shared = new_shared;
            if timeout_result.timed_out() {
                return shared.items.pop_front();
            }
        }
    }

    /// Close the queue and wake every blocked consumer.
    ///
    /// Items already queued remain poppable; further pushes are
    /// rejected.
    pub fn close(&self) {
        {
            let mut shared = self.lock();
            shared.closed = true;
        }
        self.not_empty.notify_all();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fifo_order_single_producer() {
        let queue = BlockingQueue::unbounded();
        for i in 0_u32..100 {
            queue.push(i).expect("push");
        }
        for i in 0_u32..100 {
            assert_eq!(queue.try_pop(), Some(i));
        }
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn bounded_rejects_when_full_and_hands_item_back() {
        let queue = BlockingQueue::bounded(2);
        queue.push(1_u32).expect("push 1");
        queue.push(2_u32).expect("push 2");
        match queue.push(3_u32) {
            Err(PushError::Full(item)) => assert_eq!(item, 3),
            other => panic!("expected Full, got {other:?}"),
        }
        assert_eq!(queue.try_pop(), Some(1));
        queue.push(3_u32).expect("push after pop");
    }

    #[test]
    fn push_after_close_is_rejected() {
        let queue = BlockingQueue::unbounded();
        queue.push(1_u32).expect("push");
        queue.close();
        match queue.push(2_u32) {
            Err(PushError::Closed(item)) => assert_eq!(item, 2),
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[test]
    fn close_drains_remaining_items_then_reports_none() {
        let queue = BlockingQueue::unbounded();
        queue.push(1_u32).expect("push");
        queue.push(2_u32).expect("push");
        queue.close();
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let queue = Arc::new(BlockingQueue::<u32>::unbounded());
        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.pop())
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(consumer.join().expect("consumer join"), None);
    }

    #[test]
    fn pop_timeout_gives_up_on_empty_queue() {
        let queue = BlockingQueue::<u32>::unbounded();
        let started = Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_millis(30)), None);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn multi_producer_multi_consumer_conserves_items() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 3;
        const PER_PRODUCER: usize = 500;

        let queue = Arc::new(BlockingQueue::<usize>::unbounded());
        let consumed = Arc::new(AtomicUsize::new(0));

        let mut producers = Vec::new();
        for p in 0..PRODUCERS {
            let queue = Arc::clone(&queue);
            producers.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    queue.push(p * PER_PRODUCER + i).expect("push");
                }
            }));
        }

        let mut consumers = Vec::new();
        for _ in 0..CONSUMERS {
            let queue = Arc::clone(&queue);
            let consumed = Arc::clone(&consumed);
            consumers.push(std::thread::spawn(move || {
                while queue.pop().is_some() {
                    consumed.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        for handle in producers {
            handle.join().expect("producer join");
        }
        queue.close();
        for handle in consumers {
            handle.join().expect("consumer join");
        }

        assert_eq!(consumed.load(Ordering::SeqCst), PRODUCERS * PER_PRODUCER);
        assert!(queue.is_empty());
    }

    #[test]
    fn blocking_pop_receives_item_pushed_later() {
        let queue = Arc::new(BlockingQueue::<u32>::unbounded());
        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.pop())
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.push(77).expect("push");
        assert_eq!(consumer.join().expect("consumer join"), Some(77));
    }
}
