//! Bounded intake queue between the receive loop and the worker pool
//!
//! Admission never waits: when the queue is full the frame is handed back to
//! the caller and shed. Consumers wait with a timeout so they can observe
//! shutdown periodically.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Default number of frames the queue holds before shedding load
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Outcome of a [`BoundedQueue::dequeue`] call
#[derive(Debug, PartialEq, Eq)]
pub enum Dequeued<T> {
    /// An item was removed from the head of the queue
    Item(T),
    /// Nothing arrived within the timeout
    TimedOut,
    /// The queue was closed and every item has been drained
    Closed,
}

/// Why an item was not admitted
#[derive(Debug, PartialEq, Eq)]
pub enum Rejected<T> {
    /// The queue is at capacity
    Full(T),
    /// The queue has been closed for shutdown
    Closed(T),
}

impl<T> Rejected<T> {
    /// Recover the rejected item
    pub fn into_inner(self) -> T {
        match self {
            Rejected::Full(item) | Rejected::Closed(item) => item,
        }
    }
}

/// Fixed-capacity FIFO queue with non-blocking admission.
///
/// Safe to share between one producer and any number of consumers behind an
/// `Arc`. The length never exceeds the capacity.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    len: AtomicUsize,
    closed: AtomicBool,
    available: Notify,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity,
            len: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            available: Notify::new(),
        }
    }

    /// Try to append an item without waiting.
    pub fn try_enqueue(&self, item: T) -> Result<(), Rejected<T>> {
        self.try_enqueue_with(item, || ())
    }

    /// Like [`try_enqueue`](Self::try_enqueue), running `on_admit` before the
    /// item becomes visible to consumers.
    pub fn try_enqueue_with(&self, item: T, on_admit: impl FnOnce()) -> Result<(), Rejected<T>> {
        {
            let mut items = self.lock();
            if self.is_closed() {
                return Err(Rejected::Closed(item));
            }
            if items.len() >= self.capacity {
                return Err(Rejected::Full(item));
            }
            on_admit();
            items.push_back(item);
            self.len.store(items.len(), Ordering::Release);
        }

        self.available.notify_one();
        Ok(())
    }

    /// Remove the head item, waiting up to `timeout` for one to arrive.
    pub async fn dequeue(&self, timeout: Duration) -> Dequeued<T> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before checking state so a concurrent enqueue or close is not missed
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.pop() {
                return Dequeued::Item(item);
            }

            if self.is_closed() {
                // Re-check after observing the flag so nothing enqueued before close is stranded
                return match self.pop() {
                    Some(item) => Dequeued::Item(item),
                    None => Dequeued::Closed,
                };
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Dequeued::TimedOut;
            }
        }
    }

    /// Stop admitting items. Consumers drain what is left, then see `Closed`.
    pub fn close(&self) {
        {
            // Flip under the lock so no admission can race past the flag
            let _items = self.lock();
            self.closed.store(true, Ordering::Release);
        }
        self.available.notify_waiters();
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current number of queued items
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of items
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue depth as a fraction of capacity
    pub fn fill_ratio(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    fn pop(&self) -> Option<T> {
        let (item, remaining) = {
            let mut items = self.lock();
            let item = items.pop_front();
            self.len.store(items.len(), Ordering::Release);
            (item, items.len())
        };

        // A single stored permit can cover several pushes; pass the wakeup on
        if item.is_some() && remaining > 0 {
            self.available.notify_one();
        }
        item
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        // Critical sections never panic, but recover rather than poison every stage
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn rejects_when_full() {
        let queue = BoundedQueue::new(10);
        let mut admitted = 0;
        let mut shed = 0;

        for i in 0..15 {
            match queue.try_enqueue(i) {
                Ok(()) => admitted += 1,
                Err(Rejected::Full(_)) => shed += 1,
                Err(Rejected::Closed(_)) => unreachable!(),
            }
        }

        assert_eq!(admitted, 10);
        assert_eq!(shed, 5);
        assert_eq!(queue.len(), 10);
        assert!((queue.fill_ratio() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rejected_item_is_returned() {
        let queue = BoundedQueue::new(1);
        queue.try_enqueue("first").unwrap();
        let rejected = queue.try_enqueue("second").unwrap_err();
        assert_eq!(rejected.into_inner(), "second");
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let queue = BoundedQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        assert!(queue.try_enqueue(1).is_ok());
        assert!(queue.try_enqueue(2).is_err());
    }

    #[tokio::test]
    async fn dequeue_is_fifo() {
        let queue = BoundedQueue::new(8);
        for i in 0..5 {
            queue.try_enqueue(i).unwrap();
        }

        for i in 0..5 {
            assert_eq!(queue.dequeue(SHORT).await, Dequeued::Item(i));
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn dequeue_times_out_when_empty() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(4);
        assert_eq!(queue.dequeue(SHORT).await, Dequeued::TimedOut);
    }

    #[tokio::test]
    async fn waiting_consumer_is_woken_by_enqueue() {
        let queue = Arc::new(BoundedQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.try_enqueue(42u32).unwrap();

        assert_eq!(consumer.await.unwrap(), Dequeued::Item(42));
    }

    #[tokio::test]
    async fn close_drains_before_reporting_closed() {
        let queue = BoundedQueue::new(4);
        queue.try_enqueue(1).unwrap();
        queue.try_enqueue(2).unwrap();
        queue.close();

        assert!(matches!(queue.try_enqueue(3), Err(Rejected::Closed(3))));
        assert_eq!(queue.dequeue(SHORT).await, Dequeued::Item(1));
        assert_eq!(queue.dequeue(SHORT).await, Dequeued::Item(2));
        assert_eq!(queue.dequeue(SHORT).await, Dequeued::Closed);
    }

    #[tokio::test]
    async fn close_wakes_idle_consumers() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(4));
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        for consumer in consumers {
            let outcome = tokio::time::timeout(Duration::from_secs(1), consumer).await;
            assert_eq!(outcome.unwrap().unwrap(), Dequeued::Closed);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_consumers_see_every_item_once() {
        let queue = Arc::new(BoundedQueue::new(1_000));
        for i in 0..1_000u32 {
            queue.try_enqueue(i).unwrap();
        }
        queue.close();

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    while let Dequeued::Item(i) = queue.dequeue(SHORT).await {
                        seen.push(i);
                    }
                    seen
                })
            })
            .collect();

        let mut all = Vec::new();
        for consumer in consumers {
            let seen = consumer.await.unwrap();
            // Per-consumer order follows dequeue order
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
            all.extend(seen);
        }

        all.sort_unstable();
        assert_eq!(all, (0..1_000).collect::<Vec<_>>());
    }

    proptest! {
        #[test]
        fn prop_len_never_exceeds_capacity(
            capacity in 1usize..64,
            ops in prop::collection::vec(any::<bool>(), 0..300)
        ) {
            let queue = BoundedQueue::new(capacity);
            let mut admitted = 0u64;
            let mut shed = 0u64;
            let mut expected_len = 0usize;

            for push in ops {
                if push {
                    match queue.try_enqueue(()) {
                        Ok(()) => { admitted += 1; expected_len += 1; }
                        Err(_) => shed += 1,
                    }
                } else if queue.pop().is_some() {
                    expected_len -= 1;
                }

                prop_assert!(queue.len() <= capacity);
                prop_assert_eq!(queue.len(), expected_len);
            }

            // A rejection only ever happens at capacity
            if shed > 0 {
                prop_assert!(admitted >= capacity as u64);
            }
        }
    }
}
