//! The scan dispatcher: intake, execution and retry wired together.

use crate::audit::{
    Counter, DispatchEvent, DispatchMetrics, EventKind, EventSink, MetricsSnapshot,
    TracingEventSink,
};
use crate::config::DispatchConfig;
use crate::core::{
    dedup_key, ArcBackend, DispatchError, QueueError, ScanBackend, ScanError, ScanFailure, ScanRequest,
    ScanResult, ScanStatus,
};
use crate::manager::dedup::{DedupCache, DedupStats};
use crate::manager::pool::{PoolStats, ScanHandler, WorkerPool};
use crate::manager::queue::ScanQueue;
use crate::manager::retry::RetryPolicy;
use crate::manager::shutdown::{RetryTracker, ShutdownCoordinator, ShutdownReport};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What intake did with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The request was queued for scanning.
    Enqueued {
        /// ID of the queued request.
        request_id: String,
    },
    /// The same image was seen within the dedup window; nothing was queued.
    Duplicate {
        /// ID of the suppressed request.
        request_id: String,
    },
}

impl EnqueueOutcome {
    /// Returns true if the request was queued.
    pub fn is_enqueued(&self) -> bool {
        matches!(self, Self::Enqueued { .. })
    }

    /// Returns true if the request was suppressed as a duplicate.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// Point-in-time dispatcher statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchStats {
    /// Whether intake accepts requests.
    pub intake_open: bool,
    /// Queue capacity.
    pub queue_capacity: usize,
    /// Queue fill level in percent.
    pub queue_utilization: f64,
    /// Worker pool statistics.
    pub pool: PoolStats,
    /// Dedup statistics, when dedup is enabled.
    pub dedup: Option<DedupStats>,
    /// Retry timers still waiting.
    pub pending_retries: usize,
    /// Counter snapshot.
    pub metrics: MetricsSnapshot,
}

/// Builder for creating a [`ScanDispatcher`].
pub struct ScanDispatcherBuilder {
    backend: Option<ArcBackend>,
    config: DispatchConfig,
    events: Option<Arc<dyn EventSink>>,
    metrics: Option<Arc<DispatchMetrics>>,
}

impl ScanDispatcherBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self {
            backend: None,
            config: DispatchConfig::default(),
            events: None,
            metrics: None,
        }
    }

    /// Sets the backend that runs scans.
    pub fn with_backend<B: ScanBackend + 'static>(mut self, backend: B) -> Self {
        self.backend = Some(Arc::new(backend));
        self
    }

    /// Sets a backend wrapped in an Arc.
    pub fn with_arc_backend(mut self, backend: ArcBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Sets the configuration.
    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the event sink. Defaults to [`TracingEventSink`].
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Sets the metrics instance. Defaults to a private one.
    pub fn with_metrics(mut self, metrics: Arc<DispatchMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds the dispatcher.
    ///
    /// # Errors
    ///
    /// `ScanError::Configuration` if no backend was set, the dispatch
    /// configuration is invalid, or the backend rejects its own settings.
    pub fn build(self) -> Result<ScanDispatcher, ScanError> {
        let backend = self
            .backend
            .ok_or_else(|| ScanError::configuration("a scan backend is required"))?;
        self.config.validate()?;
        backend.validate_config()?;

        let config = self.config;
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(TracingEventSink) as Arc<dyn EventSink>);
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(DispatchMetrics::new()));

        let queue = Arc::new(ScanQueue::new(config.queue.capacity));
        let dedup = config
            .dedup
            .enabled
            .then(|| Arc::new(DedupCache::new(config.dedup.ttl)));
        let retries = Arc::new(RetryTracker::new());

        let handler = Arc::new(DispatchHandler {
            backend: Arc::clone(&backend),
            retry: Arc::new(RetryPolicy::new(config.retry.clone(), Arc::clone(&queue))),
            retries: Arc::clone(&retries),
            events: Arc::clone(&events),
            metrics: Arc::clone(&metrics),
        });
        let pool = Arc::new(WorkerPool::new(
            config.workers.clone(),
            Arc::clone(&queue),
            handler,
        ));

        let mut shutdown = ShutdownCoordinator::new(Arc::clone(&pool), Arc::clone(&queue))
            .with_retry_tracker(retries)
            .with_event_sink(Arc::clone(&events))
            .with_metrics(Arc::clone(&metrics));
        if let Some(dedup) = &dedup {
            shutdown = shutdown.with_dedup(Arc::clone(dedup));
        }

        tracing::info!(
            backend = %backend.backend_type(),
            queue_capacity = config.queue.capacity,
            workers = config.workers.count,
            dedup = config.dedup.enabled,
            max_retries = config.retry.max_retries,
            "Scan dispatcher built"
        );

        Ok(ScanDispatcher {
            backend,
            config,
            queue,
            dedup,
            pool,
            shutdown,
            events,
            metrics,
            intake_cancel: CancellationToken::new(),
            sweeper: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }
}

impl Default for ScanDispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts scan requests and runs them through the configured backend.
///
/// ```rust,ignore
/// let dispatcher = ScanDispatcher::builder()
///     .with_backend(MockBackend::new())
///     .with_config(DispatchConfig::new().with_worker_count(2))
///     .build()?;
/// dispatcher.start();
///
/// dispatcher.enqueue_scan_request(ScanRequest::new("app:1.4", "hub"))?;
///
/// let report = dispatcher.shutdown(Duration::from_secs(30)).await;
/// ```
pub struct ScanDispatcher {
    backend: ArcBackend,
    config: DispatchConfig,
    queue: Arc<ScanQueue>,
    dedup: Option<Arc<DedupCache>>,
    pool: Arc<WorkerPool>,
    shutdown: ShutdownCoordinator,
    events: Arc<dyn EventSink>,
    metrics: Arc<DispatchMetrics>,
    intake_cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl ScanDispatcher {
    /// Creates a new builder.
    pub fn builder() -> ScanDispatcherBuilder {
        ScanDispatcherBuilder::new()
    }

    /// Starts the workers and the dedup sweeper. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(dedup) = &self.dedup {
            let handle = dedup.start_sweeper();
            *self
                .sweeper
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        }
        self.pool.start();
        tracing::info!(backend = %self.backend.backend_type(), "Scan dispatcher started");
    }

    /// Accepts one scan request.
    ///
    /// The request's retry ceiling is set from the dispatch configuration.
    /// A request for an image seen within the dedup window is reported as
    /// [`EnqueueOutcome::Duplicate`] and not queued.
    ///
    /// # Errors
    ///
    /// `DispatchError::Rejected` when the queue is full, the queue is
    /// closed, or intake has been shut.
    pub fn enqueue_scan_request(
        &self,
        request: ScanRequest,
    ) -> Result<EnqueueOutcome, DispatchError> {
        if !self.shutdown.intake_open() {
            return Err(self.reject(&request, "intake closed"));
        }

        let request = request.with_max_retries(self.config.retry.max_retries);

        let mut recorded_key = None;
        if let Some(dedup) = &self.dedup {
            let duplicate = dedup.is_duplicate(&request);
            let kind = if duplicate {
                EventKind::CacheHit
            } else {
                EventKind::CacheMiss
            };
            self.events.emit(
                DispatchEvent::new(kind)
                    .with("request_id", &request.id)
                    .with("image", &request.image_ref)
                    .with("digest", request.digest.as_deref().unwrap_or("")),
            );

            if duplicate {
                self.metrics.increment(Counter::Duplicates);
                tracing::debug!(
                    request_id = %request.id,
                    image = %request.image_ref,
                    "Duplicate scan request suppressed"
                );
                return Ok(EnqueueOutcome::Duplicate {
                    request_id: request.id,
                });
            }
            recorded_key = Some(dedup_key(&request));
        }

        let request_id = request.id.clone();
        let image = request.image_ref.clone();
        let registry = request.registry.clone();

        match self.queue.enqueue(request, &self.intake_cancel) {
            Ok(()) => {
                self.metrics.increment(Counter::Enqueued);
                self.events.emit(
                    DispatchEvent::new(EventKind::RequestEnqueued)
                        .with("request_id", &request_id)
                        .with("image", &image)
                        .with("registry", &registry),
                );
                self.events.emit(
                    DispatchEvent::new(EventKind::QueueDepth)
                        .with("depth", self.queue.depth())
                        .with("capacity", self.queue.capacity()),
                );
                Ok(EnqueueOutcome::Enqueued { request_id })
            }
            Err(err) => {
                // Refused work must not hold the dedup window.
                if let (Some(dedup), Some(key)) = (&self.dedup, &recorded_key) {
                    dedup.forget(key);
                }
                let reason = match err {
                    QueueError::Full => "queue full",
                    QueueError::Closed => "queue closed",
                    QueueError::Cancelled => "intake closed",
                };
                self.metrics.increment(Counter::Rejected);
                self.events.emit(
                    DispatchEvent::new(EventKind::RequestRejected)
                        .with("request_id", &request_id)
                        .with("image", &image)
                        .with("reason", reason),
                );
                tracing::warn!(
                    request_id = %request_id,
                    image = %image,
                    reason = reason,
                    queue_depth = self.queue.depth(),
                    "Scan request rejected"
                );
                Err(DispatchError::rejected(reason))
            }
        }
    }

    /// Returns current statistics.
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            intake_open: self.shutdown.intake_open(),
            queue_capacity: self.queue.capacity(),
            queue_utilization: self.queue.utilization(),
            pool: self.pool.stats(),
            dedup: self.dedup.as_ref().map(|d| d.stats()),
            pending_retries: self.shutdown.retries().pending(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Shuts the dispatcher down. See [`ShutdownCoordinator::shutdown`].
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.intake_cancel.cancel();
        let report = self.shutdown.shutdown(timeout).await;

        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = sweeper {
            let _ = handle.await;
        }
        report
    }

    /// Shuts down using the configured shutdown timeout.
    pub async fn shutdown_default(&self) -> ShutdownReport {
        self.shutdown(self.config.shutdown_timeout).await
    }

    fn reject(&self, request: &ScanRequest, reason: &'static str) -> DispatchError {
        self.metrics.increment(Counter::Rejected);
        self.events.emit(
            DispatchEvent::new(EventKind::RequestRejected)
                .with("request_id", &request.id)
                .with("image", &request.image_ref)
                .with("reason", reason),
        );
        DispatchError::rejected(reason)
    }
}

impl std::fmt::Debug for ScanDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanDispatcher")
            .field("backend", &self.backend.backend_type())
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish()
    }
}

/// Runs each dequeued request against the backend and routes the outcome.
struct DispatchHandler {
    backend: ArcBackend,
    retry: Arc<RetryPolicy>,
    retries: Arc<RetryTracker>,
    events: Arc<dyn EventSink>,
    metrics: Arc<DispatchMetrics>,
}

impl DispatchHandler {
    fn completed(&self, result: &ScanResult) {
        self.metrics.increment(Counter::Completed);

        let mut event = DispatchEvent::new(EventKind::ScanCompleted)
            .with("request_id", &result.request_id)
            .with("image", &result.image_ref)
            .with("backend", &result.backend)
            .with("status", result.status)
            .with("duration_ms", result.duration.as_millis());
        if let Some(code) = result.exit_code {
            event = event.with("exit_code", code);
        }
        if let Some(counts) = &result.vulnerabilities {
            event = event
                .with("critical", counts.critical)
                .with("high", counts.high)
                .with("medium", counts.medium)
                .with("low", counts.low);
        }
        self.events.emit(event);

        tracing::info!(
            request_id = %result.request_id,
            image = %result.image_ref,
            duration_ms = result.duration.as_millis() as u64,
            "Scan completed"
        );
    }

    fn failed(&self, request: ScanRequest, failure: ScanFailure) {
        let kind = if failure.status() == ScanStatus::Timeout {
            self.metrics.increment(Counter::TimedOut);
            EventKind::ScanTimeout
        } else {
            self.metrics.increment(Counter::Failed);
            EventKind::ScanFailed
        };
        self.events.emit(
            DispatchEvent::new(kind)
                .with("request_id", &request.id)
                .with("image", &request.image_ref)
                .with("backend", &failure.result.backend)
                .with("status", failure.status())
                .with("retry_count", request.retry_count)
                .with("error", &failure.error),
        );

        self.route_failure(request, failure.error.to_string());
    }

    /// Hands a failed request to the retry scheduler, or gives up on it.
    fn route_failure(&self, request: ScanRequest, error: String) {
        if !self.retry.should_retry(&request, &error) {
            self.exhausted(&request, &error);
            return;
        }

        if self.retries.is_cancelled() {
            self.dropped(&request, "shutdown in progress");
            return;
        }

        self.metrics.increment(Counter::Retried);
        self.events.emit(
            DispatchEvent::new(EventKind::ScanRetried)
                .with("request_id", &request.id)
                .with("image", &request.image_ref)
                .with("retry_count", request.retry_count + 1)
                .with(
                    "backoff_ms",
                    self.retry
                        .calculate_backoff(request.retry_count + 1)
                        .as_millis(),
                )
                .with("error", &error),
        );

        let retry = Arc::clone(&self.retry);
        let events = Arc::clone(&self.events);
        let metrics = Arc::clone(&self.metrics);
        let cancel = self.retries.token();

        self.retries.track(tokio::spawn(async move {
            let request_id = request.id.clone();
            let image = request.image_ref.clone();
            if let Err(err) = retry.schedule_retry(request, &error, &cancel).await {
                metrics.increment(Counter::Dropped);
                events.emit(
                    DispatchEvent::new(EventKind::RequestDropped)
                        .with("request_id", &request_id)
                        .with("image", &image)
                        .with("reason", &err),
                );
                tracing::warn!(
                    request_id = %request_id,
                    image = %image,
                    error = %err,
                    "Retry could not be requeued"
                );
            }
        }));
    }

    fn exhausted(&self, request: &ScanRequest, error: &str) {
        self.metrics.increment(Counter::Exhausted);
        self.events.emit(
            DispatchEvent::new(EventKind::ScanExhausted)
                .with("request_id", &request.id)
                .with("image", &request.image_ref)
                .with("retry_count", request.retry_count)
                .with("max_retries", request.max_retries)
                .with("error", error),
        );
        tracing::error!(
            request_id = %request.id,
            image = %request.image_ref,
            retry_count = request.retry_count,
            error = %error,
            "Scan abandoned"
        );
    }

    fn dropped(&self, request: &ScanRequest, reason: &str) {
        self.metrics.increment(Counter::Dropped);
        self.events.emit(
            DispatchEvent::new(EventKind::RequestDropped)
                .with("request_id", &request.id)
                .with("image", &request.image_ref)
                .with("retry_count", request.retry_count)
                .with("reason", reason),
        );
    }
}

#[async_trait]
impl ScanHandler for DispatchHandler {
    async fn handle(&self, request: ScanRequest, cancel: CancellationToken) {
        self.events.emit(
            DispatchEvent::new(EventKind::RequestDequeued)
                .with("request_id", &request.id)
                .with("image", &request.image_ref),
        );
        self.events.emit(
            DispatchEvent::new(EventKind::ScanStarted)
                .with("request_id", &request.id)
                .with("image", &request.image_ref)
                .with("backend", self.backend.backend_type())
                .with("attempt", request.retry_count + 1),
        );

        let outcome = self.backend.scan(&request, cancel.clone()).await;
        if cancel.is_cancelled() {
            // The pool reports the deadline.
            tracing::debug!(
                request_id = %request.id,
                image = %request.image_ref,
                "Scan stopped at its deadline"
            );
            return;
        }

        match outcome {
            Ok(result) => self.completed(&result),
            Err(failure) => self.failed(request, failure),
        }
    }

    async fn deadline_exceeded(&self, request: ScanRequest, deadline: Duration) {
        let error = ScanError::timeout(self.backend.backend_type(), deadline);
        self.metrics.increment(Counter::TimedOut);
        self.events.emit(
            DispatchEvent::new(EventKind::ScanTimeout)
                .with("request_id", &request.id)
                .with("image", &request.image_ref)
                .with("backend", self.backend.backend_type())
                .with("deadline_ms", deadline.as_millis())
                .with("error", &error),
        );
        self.route_failure(request, error.to_string());
    }
}
