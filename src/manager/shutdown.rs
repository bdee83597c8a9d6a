//! Ordered, bounded shutdown of the dispatch pipeline.
//!
//! Shutdown runs these steps once, in order:
//!
//! 1. close the intake gate so new requests are rejected;
//! 2. cancel pending retry timers;
//! 3. stop the worker pool, waiting at most the given timeout;
//! 4. wait for the cancelled retry tasks with what is left of the timeout;
//! 5. close the queue and drop whatever is still queued;
//! 6. stop the dedup sweeper.
//!
//! Every request left behind is reported through a `request_dropped`
//! event, never discarded silently.

use crate::audit::{Counter, DispatchEvent, DispatchMetrics, EventKind, EventSink, TracingEventSink};
use crate::core::DispatchError;
use crate::manager::dedup::DedupCache;
use crate::manager::pool::WorkerPool;
use crate::manager::queue::ScanQueue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outcome of a shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// In-flight scans were still running when the timeout elapsed.
    pub timed_out: bool,
    /// Queued requests dropped without being scanned.
    pub dropped: usize,
    /// Retry timers that were cancelled.
    pub cancelled_retries: usize,
    /// Time spent shutting down.
    pub elapsed: Duration,
}

impl ShutdownReport {
    /// Converts a timed-out report into `DispatchError::ShutdownTimedOut`.
    pub fn into_result(self, timeout: Duration) -> Result<Self, DispatchError> {
        if self.timed_out {
            Err(DispatchError::ShutdownTimedOut { timeout })
        } else {
            Ok(self)
        }
    }
}

/// Pending retry timers, cancellable as a group.
#[derive(Debug, Default)]
pub struct RetryTracker {
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RetryTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the token retry tasks must observe.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns true once the timers have been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Registers a spawned retry task.
    pub fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Returns the number of retry tasks still waiting.
    pub fn pending(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Cancels every timer and hands back the tasks to wait on.
    fn cancel_all(&self) -> Vec<JoinHandle<()>> {
        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        self.cancel.cancel();
        tasks
    }
}

/// Owns the intake gate and tears the pipeline down.
pub struct ShutdownCoordinator {
    pool: Arc<WorkerPool>,
    queue: Arc<ScanQueue>,
    dedup: Option<Arc<DedupCache>>,
    retries: Arc<RetryTracker>,
    events: Arc<dyn EventSink>,
    metrics: Arc<DispatchMetrics>,
    intake_open: AtomicBool,
    started: AtomicBool,
    report: OnceLock<ShutdownReport>,
}

impl ShutdownCoordinator {
    /// Creates a coordinator for the given pool and queue.
    pub fn new(pool: Arc<WorkerPool>, queue: Arc<ScanQueue>) -> Self {
        Self {
            pool,
            queue,
            dedup: None,
            retries: Arc::new(RetryTracker::new()),
            events: Arc::new(TracingEventSink),
            metrics: Arc::new(DispatchMetrics::new()),
            intake_open: AtomicBool::new(true),
            started: AtomicBool::new(false),
            report: OnceLock::new(),
        }
    }

    /// Stops this dedup cache as the last step.
    pub fn with_dedup(mut self, dedup: Arc<DedupCache>) -> Self {
        self.dedup = Some(dedup);
        self
    }

    /// Shares a retry tracker with the component that spawns retries.
    pub fn with_retry_tracker(mut self, retries: Arc<RetryTracker>) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the sink for `request_dropped` events.
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the metrics that count dropped requests.
    pub fn with_metrics(mut self, metrics: Arc<DispatchMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Returns true while intake may accept requests.
    pub fn intake_open(&self) -> bool {
        self.intake_open.load(Ordering::SeqCst)
    }

    /// Returns the retry timers this coordinator cancels.
    pub fn retries(&self) -> &Arc<RetryTracker> {
        &self.retries
    }

    /// Returns true once shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Shuts the pipeline down, waiting at most `timeout` for in-flight scans.
    ///
    /// Only the first call does any work; later calls return the first
    /// call's report (or an empty one while it is still running).
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        if self.started.swap(true, Ordering::SeqCst) {
            return self.report.get().copied().unwrap_or_default();
        }

        let started = Instant::now();
        tracing::info!(
            timeout_ms = timeout.as_millis() as u64,
            queue_depth = self.queue.depth(),
            "Shutting down scan dispatch"
        );

        self.intake_open.store(false, Ordering::SeqCst);

        let retry_tasks = self.retries.cancel_all();
        let cancelled_retries = retry_tasks.iter().filter(|t| !t.is_finished()).count();

        let timed_out = self.pool.stop(timeout).await.is_err();

        // Cancelled retry tasks report their own drops; give them what is
        // left of the budget to do so.
        let remaining = timeout.saturating_sub(started.elapsed());
        if !retry_tasks.is_empty()
            && tokio::time::timeout(remaining, futures::future::join_all(retry_tasks))
                .await
                .is_err()
        {
            tracing::warn!("Retry tasks still running after shutdown budget");
        }

        self.queue.close();
        let leftovers = self.queue.drain();
        let dropped = leftovers.len();
        for request in leftovers {
            self.metrics.increment(Counter::Dropped);
            self.events.emit(
                DispatchEvent::new(EventKind::RequestDropped)
                    .with("request_id", &request.id)
                    .with("image", &request.image_ref)
                    .with("registry", &request.registry)
                    .with("retry_count", request.retry_count)
                    .with("reason", "shutdown"),
            );
        }

        if let Some(dedup) = &self.dedup {
            dedup.stop();
        }

        let report = ShutdownReport {
            timed_out,
            dropped,
            cancelled_retries,
            elapsed: started.elapsed(),
        };

        if timed_out {
            tracing::warn!(
                dropped = report.dropped,
                cancelled_retries = report.cancelled_retries,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Shutdown finished with scans still in flight"
            );
        } else {
            tracing::info!(
                dropped = report.dropped,
                cancelled_retries = report.cancelled_retries,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Shutdown complete"
            );
        }

        let _ = self.report.set(report);
        report
    }
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("intake_open", &self.intake_open())
            .field("shutting_down", &self.is_shutting_down())
            .field("pending_retries", &self.retries.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryEventSink;
    use crate::config::WorkerConfig;
    use crate::core::ScanRequest;
    use crate::manager::pool::ScanHandler;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct SlowHandler(Duration);

    #[async_trait]
    impl ScanHandler for SlowHandler {
        async fn handle(&self, _request: ScanRequest, _cancel: CancellationToken) {
            tokio::time::sleep(self.0).await;
        }
    }

    fn coordinator(
        latency: Duration,
        queue: Arc<ScanQueue>,
        sink: Arc<MemoryEventSink>,
    ) -> (ShutdownCoordinator, Arc<WorkerPool>) {
        let pool = Arc::new(WorkerPool::new(
            WorkerConfig {
                count: 1,
                scan_deadline: Duration::from_secs(30),
            },
            Arc::clone(&queue),
            Arc::new(SlowHandler(latency)),
        ));
        let coordinator = ShutdownCoordinator::new(Arc::clone(&pool), queue).with_event_sink(sink);
        (coordinator, pool)
    }

    #[tokio::test]
    async fn test_shutdown_drops_queued_requests_with_events() {
        let queue = Arc::new(ScanQueue::new(10));
        let sink = Arc::new(MemoryEventSink::new());
        let (coordinator, pool) = coordinator(Duration::from_millis(200), Arc::clone(&queue), sink.clone());

        let cancel = CancellationToken::new();
        for image in ["a", "b", "c"] {
            queue.enqueue(ScanRequest::new(image, "hub"), &cancel).unwrap();
        }
        pool.start();
        // Let the single worker pick up "a".
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = coordinator.shutdown(Duration::from_secs(2)).await;

        assert!(!report.timed_out);
        assert_eq!(report.dropped, 2);
        assert!(!coordinator.intake_open());
        assert!(queue.is_closed());
        assert_eq!(sink.count(EventKind::RequestDropped), 2);
    }

    #[tokio::test]
    async fn test_shutdown_reports_timeout() {
        let queue = Arc::new(ScanQueue::new(10));
        let sink = Arc::new(MemoryEventSink::new());
        let (coordinator, pool) = coordinator(Duration::from_secs(5), Arc::clone(&queue), sink);

        queue
            .enqueue(ScanRequest::new("slow", "hub"), &CancellationToken::new())
            .unwrap();
        pool.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let timeout = Duration::from_millis(100);
        let report = coordinator.shutdown(timeout).await;
        assert!(report.timed_out);
        assert!(matches!(
            report.into_result(timeout),
            Err(DispatchError::ShutdownTimedOut { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let queue = Arc::new(ScanQueue::new(10));
        let sink = Arc::new(MemoryEventSink::new());
        let (coordinator, pool) = coordinator(Duration::ZERO, Arc::clone(&queue), sink.clone());
        pool.start();

        let first = coordinator.shutdown(Duration::from_secs(1)).await;
        let second = coordinator.shutdown(Duration::from_secs(1)).await;
        assert_eq!(first, second);
        assert_eq!(sink.count(EventKind::RequestDropped), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_retry_timers() {
        let queue = Arc::new(ScanQueue::new(10));
        let sink = Arc::new(MemoryEventSink::new());
        let (coordinator, pool) = coordinator(Duration::ZERO, Arc::clone(&queue), sink);
        pool.start();

        let token = coordinator.retries().token();
        coordinator.retries().track(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                _ = token.cancelled() => {}
            }
        }));
        assert_eq!(coordinator.retries().pending(), 1);

        let report = coordinator.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report.cancelled_retries, 1);
        assert!(coordinator.retries().is_cancelled());
        assert!(report.elapsed < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_shutdown_stops_dedup_sweeper() {
        let queue = Arc::new(ScanQueue::new(10));
        let sink = Arc::new(MemoryEventSink::new());
        let (coordinator, pool) = coordinator(Duration::ZERO, Arc::clone(&queue), sink);
        let dedup = Arc::new(DedupCache::new(Duration::from_secs(60)));
        let sweeper = dedup.start_sweeper();
        let coordinator = coordinator.with_dedup(Arc::clone(&dedup));
        pool.start();

        coordinator.shutdown(Duration::from_secs(1)).await;
        assert!(dedup.is_stopped());
        sweeper.await.unwrap();
    }
}
