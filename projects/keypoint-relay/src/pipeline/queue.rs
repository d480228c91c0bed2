// Bounded handoff queue between the decode callback and the result worker.
//
// Full-queue policy: `push` waits up to `push_timeout` for space, then the
// item is handed back as `PushError::Full` and counted in `dropped()`.
// Frame loss is therefore bounded in latency and always observable.

use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("timed out waiting for an item")]
    Timeout,
    #[error("queue has been stopped")]
    Stopped,
    #[error("queue must be stopped before it is cleared")]
    NotStopped,
}

/// A rejected push. The item is returned so the caller decides how to release it.
#[derive(Error)]
pub enum PushError<T> {
    #[error("queue full, item dropped")]
    Full(T),
    #[error("queue has been stopped")]
    Stopped(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(item) | PushError::Stopped(item) => item,
        }
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => f.write_str("Full(..)"),
            PushError::Stopped(_) => f.write_str("Stopped(..)"),
        }
    }
}

/// Thread-safe FIFO with fixed capacity, timed pop and a stop signal.
///
/// Safe under any number of producers and consumers.
pub struct HandoffQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    // Dropping the sender disconnects `stop_rx`, which wakes every blocked pop.
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
    stopped: AtomicBool,
    capacity: usize,
    push_timeout: Duration,
    dropped: AtomicU64,
}

impl<T> HandoffQueue<T> {
    pub fn new(capacity: usize, push_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = channel::bounded(capacity);
        let (stop_tx, stop_rx) = channel::bounded(0);
        Self {
            tx,
            rx,
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            stopped: AtomicBool::new(false),
            capacity,
            push_timeout,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        if self.is_stopped() {
            return Err(PushError::Stopped(item));
        }
        match self.tx.send_timeout(item, self.push_timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(item)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(PushError::Full(item))
            }
            // `rx` lives as long as `self`, so the channel never disconnects.
            Err(SendTimeoutError::Disconnected(item)) => Err(PushError::Stopped(item)),
        }
    }

    /// Waits up to `timeout` for the next item. A timeout is not terminal;
    /// only `stop()` makes this return `QueueError::Stopped`.
    pub fn pop(&self, timeout: Duration) -> Result<T, QueueError> {
        if self.is_stopped() {
            return Err(QueueError::Stopped);
        }
        channel::select! {
            recv(self.rx) -> item => item.map_err(|_| QueueError::Stopped),
            recv(self.stop_rx) -> _ => Err(QueueError::Stopped),
            default(timeout) => Err(QueueError::Timeout),
        }
    }

    /// Idempotent. Wakes all blocked callers.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Ok(mut guard) = self.stop_tx.lock() {
            guard.take();
        }
    }

    /// Drops every queued item and returns how many were released.
    pub fn clear(&self) -> Result<usize, QueueError> {
        if !self.is_stopped() {
            return Err(QueueError::NotStopped);
        }
        Ok(self.rx.try_iter().count())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items rejected because the queue stayed full for `push_timeout`.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_fifo_order() {
        let queue = HandoffQueue::new(3, Duration::from_millis(5));
        queue.push('a').unwrap();
        queue.push('b').unwrap();
        queue.push('c').unwrap();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(Duration::from_millis(10)), Ok('a'));
        assert_eq!(queue.pop(Duration::from_millis(10)), Ok('b'));
        assert_eq!(queue.pop(Duration::from_millis(10)), Ok('c'));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_pop_timeout_is_not_terminal() {
        let queue: HandoffQueue<u32> = HandoffQueue::new(4, Duration::from_millis(5));
        let start = Instant::now();
        assert_eq!(queue.pop(Duration::from_millis(10)), Err(QueueError::Timeout));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_millis(250), "took {:?}", elapsed);

        assert!(!queue.is_stopped());
        queue.push(7).unwrap();
        assert_eq!(queue.pop(Duration::from_millis(10)), Ok(7));
    }

    #[test]
    fn test_stop_wakes_blocked_pop() {
        let queue: Arc<HandoffQueue<u32>> = Arc::new(HandoffQueue::new(4, Duration::from_millis(5)));
        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let result = queue.pop(Duration::from_secs(10));
                (result, start.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(50));
        queue.stop();

        let (result, elapsed) = waiter.join().unwrap();
        assert_eq!(result, Err(QueueError::Stopped));
        assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
    }

    #[test]
    fn test_stop_is_idempotent_and_pop_returns_immediately() {
        let queue = HandoffQueue::new(4, Duration::from_millis(5));
        queue.push(1).unwrap();
        queue.stop();
        queue.stop();

        let start = Instant::now();
        assert_eq!(queue.pop(Duration::from_secs(5)), Err(QueueError::Stopped));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_push_after_stop_returns_item() {
        let queue = HandoffQueue::new(4, Duration::from_millis(5));
        queue.stop();
        match queue.push(42) {
            Err(PushError::Stopped(item)) => assert_eq!(item, 42),
            other => panic!("unexpected push result: {:?}", other),
        }
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let queue = HandoffQueue::new(2, Duration::from_millis(10));
        queue.push(1).unwrap();
        queue.push(2).unwrap();

        let start = Instant::now();
        let rejected = queue.push(3).unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert!(matches!(rejected, PushError::Full(_)));
        assert_eq!(rejected.into_inner(), 3);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_clear_requires_stop_and_releases_items() {
        let tracker = Arc::new(());
        let queue = HandoffQueue::new(8, Duration::from_millis(5));
        for _ in 0..5 {
            queue.push(tracker.clone()).unwrap();
        }
        assert_eq!(Arc::strong_count(&tracker), 6);

        assert_eq!(queue.clear(), Err(QueueError::NotStopped));
        queue.stop();
        assert_eq!(queue.clear(), Ok(5));
        assert_eq!(Arc::strong_count(&tracker), 1);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_multiple_producers_single_consumer() {
        let queue = Arc::new(HandoffQueue::new(16, Duration::from_millis(500)));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        queue.push(p * 1000 + i).unwrap();
                    }
                })
            })
            .collect();

        let mut received = Vec::new();
        while received.len() < 200 {
            if let Ok(item) = queue.pop(Duration::from_millis(500)) {
                received.push(item);
            }
        }
        for producer in producers {
            producer.join().unwrap();
        }

        // Each producer's items arrive in its own push order.
        for p in 0..4 {
            let mine: Vec<_> = received.iter().filter(|v| **v / 1000 == p).collect();
            assert_eq!(mine.len(), 50);
            assert!(mine.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
