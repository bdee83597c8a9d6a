//! Bounded FIFO queue between intake and the worker pool.
//!
//! Enqueue never waits: a full queue is reported immediately so intake can
//! turn it into backpressure. Dequeue parks the calling worker until an
//! item arrives, the queue is closed, or the caller's cancellation token
//! fires. Closing is idempotent and irreversible; requests already queued
//! stay drainable.
//!
//! Depth is tracked in an atomic counter next to the storage, so
//! `depth()`, `is_full()`, `is_empty()` and `utilization()` never touch the
//! storage lock.

use crate::core::{QueueError, ScanRequest};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A bounded, insertion-ordered queue of scan requests.
#[derive(Debug)]
pub struct ScanQueue {
    /// Maximum number of queued requests.
    capacity: usize,
    /// Queued requests, oldest first.
    items: Mutex<VecDeque<ScanRequest>>,
    /// Current number of queued requests.
    depth: AtomicUsize,
    /// Set once by `close()`.
    closed: AtomicBool,
    /// Wakes parked dequeuers.
    available: Notify,
}

impl ScanQueue {
    /// Creates a new queue with the given capacity (at least 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            depth: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            available: Notify::new(),
        }
    }

    /// Adds a request to the back of the queue without waiting.
    ///
    /// # Errors
    ///
    /// * `QueueError::Cancelled` - `cancel` already fired.
    /// * `QueueError::Closed` - the queue no longer accepts requests.
    /// * `QueueError::Full` - the queue is at capacity.
    pub fn enqueue(
        &self,
        mut request: ScanRequest,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        if cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        {
            let mut items = self
                .items
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            // Re-check under the lock so a concurrent close() wins.
            if self.is_closed() {
                return Err(QueueError::Closed);
            }
            if items.len() >= self.capacity {
                return Err(QueueError::Full);
            }

            request.mark_enqueued();
            items.push_back(request);
            self.depth.fetch_add(1, Ordering::SeqCst);
        }

        self.available.notify_one();
        Ok(())
    }

    /// Removes the oldest request, waiting until one is available.
    ///
    /// # Errors
    ///
    /// * `QueueError::Closed` - the queue is closed and fully drained.
    /// * `QueueError::Cancelled` - `cancel` fired while waiting.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<ScanRequest, QueueError> {
        loop {
            // Register interest before checking, so a notify between the
            // check and the await is not lost.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(request) = self.try_dequeue() {
                return Ok(request);
            }
            if self.is_closed() {
                return Err(QueueError::Closed);
            }
            if cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            }
        }
    }

    /// Removes the oldest request if one is queued.
    pub fn try_dequeue(&self) -> Option<ScanRequest> {
        let mut items = self
            .items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let request = items.pop_front()?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        let remaining = items.len();
        drop(items);

        // Pass the baton: another parked worker may be able to take the next item.
        if remaining > 0 {
            self.available.notify_one();
        }
        Some(request)
    }

    /// Closes the queue. Returns `true` on the first call only.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            tracing::debug!(depth = self.depth(), "Scan queue closed");
            self.available.notify_waiters();
        }
        first
    }

    /// Removes and returns every queued request.
    pub fn drain(&self) -> Vec<ScanRequest> {
        let mut items = self
            .items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let drained: Vec<_> = items.drain(..).collect();
        self.depth.fetch_sub(drained.len(), Ordering::SeqCst);
        drained
    }

    /// Returns the configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the current number of queued requests.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Returns true if the queue is at capacity.
    pub fn is_full(&self) -> bool {
        self.depth() >= self.capacity
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// Returns true once the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns the fill level as a percentage of capacity.
    pub fn utilization(&self) -> f64 {
        self.depth() as f64 / self.capacity as f64 * 100.0
    }
}

impl Default for ScanQueue {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    fn request(image: &str) -> ScanRequest {
        ScanRequest::new(image, "test-registry")
    }

    #[test]
    fn test_scan_queue() {
        let queue = ScanQueue::new(2);
        assert_eq!(queue.capacity(), 2);
        assert_eq!(queue.depth(), 0);
        assert!(queue.is_empty());
        assert!(!queue.is_full());
    }

    #[test]
    fn test_enqueue_full_fails_immediately() {
        let queue = ScanQueue::new(2);
        let cancel = CancellationToken::new();

        queue.enqueue(request("a"), &cancel).unwrap();
        queue.enqueue(request("b"), &cancel).unwrap();
        assert!(queue.is_full());
        assert_eq!(queue.utilization(), 100.0);

        assert_eq!(queue.enqueue(request("c"), &cancel), Err(QueueError::Full));
        assert_eq!(queue.depth(), 2);
    }

    #[test]
    fn test_enqueue_marks_timestamp() {
        let queue = ScanQueue::new(1);
        queue.enqueue(request("a"), &CancellationToken::new()).unwrap();
        assert!(queue.try_dequeue().unwrap().enqueued_at.is_some());
    }

    #[test]
    fn test_enqueue_cancelled() {
        let queue = ScanQueue::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(queue.enqueue(request("a"), &cancel), Err(QueueError::Cancelled));
    }

    #[tokio::test]
    async fn test_fifo_order_single_consumer() {
        let queue = ScanQueue::new(10);
        let cancel = CancellationToken::new();
        for image in ["a", "b", "c"] {
            queue.enqueue(request(image), &cancel).unwrap();
        }

        for expected in ["a", "b", "c"] {
            let got = queue.dequeue(&cancel).await.unwrap();
            assert_eq!(got.image_ref, expected);
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_close_keeps_pending_items_drainable() {
        let queue = ScanQueue::new(10);
        let cancel = CancellationToken::new();
        queue.enqueue(request("a"), &cancel).unwrap();

        assert!(queue.close());
        assert!(!queue.close());
        assert_eq!(queue.enqueue(request("b"), &cancel), Err(QueueError::Closed));

        assert_eq!(queue.dequeue(&cancel).await.unwrap().image_ref, "a");
        assert_eq!(queue.dequeue(&cancel).await, Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_close() {
        let queue = Arc::new(ScanQueue::new(1));
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.dequeue(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn test_dequeue_returns_on_cancel() {
        let queue = ScanQueue::new(1);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(1), queue.dequeue(&cancel))
            .await
            .unwrap();
        assert_eq!(result, Err(QueueError::Cancelled));
    }

    #[tokio::test]
    async fn test_concurrent_consumers_see_each_item_once() {
        let queue = Arc::new(ScanQueue::new(200));
        let cancel = CancellationToken::new();
        let mut expected = HashSet::new();

        for i in 0..150 {
            let req = request(&format!("image-{}", i));
            expected.insert(req.id.clone());
            queue.enqueue(req, &cancel).unwrap();
        }

        let mut consumers = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            consumers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Ok(req) = queue.dequeue(&cancel).await {
                    seen.push(req.id);
                }
                seen
            }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.close();

        let mut seen = HashSet::new();
        for consumer in consumers {
            for id in consumer.await.unwrap() {
                assert!(seen.insert(id), "request dequeued twice");
            }
        }
        assert_eq!(seen, expected);
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_depth_stays_within_bounds_under_contention() {
        let queue = Arc::new(ScanQueue::new(5));
        let cancel = CancellationToken::new();
        let mut producers = Vec::new();

        for p in 0..8 {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..50 {
                    let _ = queue.enqueue(request(&format!("{}-{}", p, i)), &cancel);
                    assert!(queue.depth() <= queue.capacity());
                    if i % 3 == 0 {
                        let _ = queue.try_dequeue();
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }
        let depth = queue.depth();
        assert!(depth <= 5);
        assert_eq!(queue.drain().len(), depth);
        assert!(queue.is_empty());
    }
}
