//! Bounded Priority Queue Implementation

use std::collections::BinaryHeap;
use std::future::pending;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::types::{Priority, QueueItem};
use crate::error::QueueError;

/// Largest heap allocation made up front; bigger capacities grow on demand.
const MAX_PREALLOCATED: usize = 1024;

/// Blocking, bounded buffer ordered by priority and then insertion order.
///
/// `put` never waits: a full queue rejects the item with [`QueueError::Full`].
/// The `get` family waits until an item arrives, the queue is closed, or the
/// caller's cancellation token / deadline fires.
pub struct BoundedPriorityQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Notify,
    capacity: usize,
}

struct Inner<T> {
    heap: BinaryHeap<QueueItem<T>>,
    next_seq: u64,
    closed: bool,
}

impl<T> BoundedPriorityQueue<T> {
    /// Create an open queue holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::with_capacity(capacity.min(MAX_PREALLOCATED)),
                next_seq: 0,
                closed: false,
            }),
            available: Notify::new(),
            capacity,
        }
    }

    /// Insert an item, waking one waiting consumer
    pub fn put(&self, priority: Priority, payload: T) -> Result<(), QueueError> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(QueueError::Closed);
            }
            if inner.heap.len() >= self.capacity {
                return Err(QueueError::Full);
            }

            let seq = inner.next_seq;
            inner.next_seq = inner.next_seq.wrapping_add(1);
            inner.heap.push(QueueItem { priority, seq, payload });
        }

        self.available.notify_one();
        Ok(())
    }

    /// Wait for the next item with no deadline
    pub async fn get(&self) -> Result<T, QueueError> {
        self.get_with_context(None, None).await
    }

    /// Wait for the next item until `cancel` fires
    pub async fn get_with_cancel(&self, cancel: &CancellationToken) -> Result<T, QueueError> {
        self.get_with_context(Some(cancel), None).await
    }

    /// Wait for the next item for at most `timeout`
    pub async fn get_timeout(&self, timeout: Duration) -> Result<T, QueueError> {
        self.get_with_context(None, Some(timeout)).await
    }

    /// Wait for the next item.
    ///
    /// Returns the highest-priority, oldest item once one is available,
    /// [`QueueError::Closed`] as soon as the queue is closed, and
    /// [`QueueError::Timeout`] when `cancel` fires or `timeout` elapses.
    pub async fn get_with_context(
        &self,
        cancel: Option<&CancellationToken>,
        timeout: Option<Duration>,
    ) -> Result<T, QueueError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            // Register interest before looking at the heap so a put or close
            // that lands between the check and the wait is not missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_take() {
                return result;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancelled(cancel) => return Err(QueueError::Timeout),
                _ = expired(deadline) => return Err(QueueError::Timeout),
            }
        }
    }

    /// Pop the next item without waiting
    pub fn try_get(&self) -> Result<Option<T>, QueueError> {
        match self.try_take() {
            Some(Ok(item)) => Ok(Some(item)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    fn try_take(&self) -> Option<Result<T, QueueError>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Some(Err(QueueError::Closed));
        }
        inner.heap.pop().map(|item| Ok(item.payload))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Close the queue, discarding every queued item and waking all waiters.
    /// Closing an already closed queue does nothing.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.heap.clear();
        }

        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Clear the closed flag. The heap is left as it is.
    pub fn open(&self) {
        self.inner.lock().closed = false;
    }

    /// Reinitialise the heap of a closed queue
    pub fn reset(&self) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if !inner.closed {
            return Err(QueueError::NotClosed);
        }
        inner.heap = BinaryHeap::with_capacity(self.capacity.min(MAX_PREALLOCATED));
        inner.next_seq = 0;
        Ok(())
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => pending().await,
    }
}

async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = BoundedPriorityQueue::new(8);
        queue.put(Priority::HIGHEST, "a").unwrap();
        queue.put(Priority::LOWEST, "b").unwrap();
        queue.put(Priority::HIGHEST, "c").unwrap();

        assert_eq!(queue.get().await.unwrap(), "a");
        assert_eq!(queue.get().await.unwrap(), "c");
        assert_eq!(queue.get().await.unwrap(), "b");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_put_on_full_queue() {
        let queue = BoundedPriorityQueue::new(2);
        queue.put(Priority::NORMAL, 1).unwrap();
        queue.put(Priority::NORMAL, 2).unwrap();

        assert_eq!(queue.put(Priority::HIGHEST, 3), Err(QueueError::Full));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_put_after_close() {
        let queue = BoundedPriorityQueue::new(2);
        queue.close();
        assert_eq!(queue.put(Priority::NORMAL, 1), Err(QueueError::Closed));
        assert_eq!(queue.try_get(), Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn test_reset_requires_closed() {
        let queue = BoundedPriorityQueue::new(4);
        queue.put(Priority::NORMAL, 1).unwrap();
        assert_eq!(queue.reset(), Err(QueueError::NotClosed));

        queue.close();
        queue.close();
        assert!(queue.reset().is_ok());
        queue.open();
        assert!(!queue.is_closed());
        assert_eq!(queue.try_get(), Ok(None));
    }

    #[tokio::test]
    async fn test_put_wakes_waiting_get() {
        let queue = Arc::new(BoundedPriorityQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.put(Priority::LOW, "late").unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer woke")
            .unwrap();
        assert_eq!(got, Ok("late"));
    }

    #[tokio::test]
    async fn test_cancel_unblocks_get() {
        let queue: Arc<BoundedPriorityQueue<u8>> = Arc::new(BoundedPriorityQueue::new(4));
        let token = CancellationToken::new();
        let consumer = {
            let queue = Arc::clone(&queue);
            let token = token.clone();
            tokio::spawn(async move { queue.get_with_cancel(&token).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer woke")
            .unwrap();
        assert_eq!(got, Err(QueueError::Timeout));
    }
}
