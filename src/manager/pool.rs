//! Fixed-size pool of workers draining the scan queue.

use crate::config::WorkerConfig;
use crate::core::{DispatchError, QueueError, ScanRequest};
use crate::manager::queue::ScanQueue;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Time a scan gets to react to its cancelled token after the deadline.
pub const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Work performed for each dequeued request.
#[async_trait]
pub trait ScanHandler: Send + Sync + 'static {
    /// Handles one request.
    ///
    /// `cancel` belongs to this scan alone; it fires when the per-scan
    /// deadline passes, never because the pool is stopping. Once it has
    /// fired the pool reports the outcome through `deadline_exceeded`, so
    /// `handle` should return without reporting one of its own.
    async fn handle(&self, request: ScanRequest, cancel: CancellationToken);

    /// Called once the per-scan deadline has passed and `handle` has
    /// returned or been dropped.
    async fn deadline_exceeded(&self, request: ScanRequest, deadline: Duration) {
        tracing::warn!(
            request_id = %request.id,
            deadline_ms = deadline.as_millis() as u64,
            "Scan exceeded its deadline"
        );
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Configured number of workers.
    pub workers: usize,
    /// Current queue depth.
    pub queue_depth: usize,
    /// Scans currently executing (best effort).
    pub in_flight: usize,
    /// Requests handled since start.
    pub processed: u64,
    /// Handler panics caught since start.
    pub panics: u64,
}

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicUsize,
    processed: AtomicU64,
    panics: AtomicU64,
}

/// A fixed set of concurrent queue consumers.
pub struct WorkerPool {
    config: WorkerConfig,
    queue: Arc<ScanQueue>,
    handler: Arc<dyn ScanHandler>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool; call [`WorkerPool::start`] to launch the workers.
    pub fn new(config: WorkerConfig, queue: Arc<ScanQueue>, handler: Arc<dyn ScanHandler>) -> Self {
        Self {
            config,
            queue,
            handler,
            cancel: CancellationToken::new(),
            counters: Arc::new(Counters::default()),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Launches the configured number of workers.
    ///
    /// Calling `start` more than once has no effect.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("Worker pool already started");
            return;
        }

        let count = self.config.count.max(1);
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        for id in 0..count {
            let worker = Worker {
                id,
                queue: Arc::clone(&self.queue),
                handler: Arc::clone(&self.handler),
                cancel: self.cancel.clone(),
                counters: Arc::clone(&self.counters),
                scan_deadline: self.config.scan_deadline,
            };
            workers.push(tokio::spawn(worker.run()));
        }

        tracing::info!(
            workers = count,
            scan_deadline_ms = self.config.scan_deadline.as_millis() as u64,
            "Worker pool started"
        );
    }

    /// Stops accepting work and waits up to `timeout` for in-flight scans.
    ///
    /// Workers that are still busy when the timeout elapses are left to
    /// finish on their own. Repeated calls return `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// `DispatchError::ShutdownTimedOut` if the wait exceeded `timeout`.
    pub async fn stop(&self, timeout: Duration) -> Result<(), DispatchError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!(
            in_flight = self.counters.in_flight.load(Ordering::Relaxed),
            timeout_ms = timeout.as_millis() as u64,
            "Stopping worker pool"
        );
        self.cancel.cancel();

        let workers: Vec<_> = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );

        match tokio::time::timeout(timeout, futures::future::join_all(workers)).await {
            Ok(_) => {
                tracing::info!("Worker pool stopped");
                Ok(())
            }
            Err(_) => {
                tracing::warn!(
                    in_flight = self.counters.in_flight.load(Ordering::Relaxed),
                    "Worker pool stop timed out; abandoning in-flight scans"
                );
                Err(DispatchError::ShutdownTimedOut { timeout })
            }
        }
    }

    /// Returns true once `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Returns current concurrency statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.config.count.max(1),
            queue_depth: self.queue.depth(),
            in_flight: self.counters.in_flight.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            panics: self.counters.panics.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

struct Worker {
    id: usize,
    queue: Arc<ScanQueue>,
    handler: Arc<dyn ScanHandler>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    scan_deadline: Duration,
}

impl Worker {
    async fn run(self) {
        tracing::debug!(worker_id = self.id, "Worker started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let request = match self.queue.dequeue(&self.cancel).await {
                Ok(request) => request,
                Err(QueueError::Closed) | Err(QueueError::Cancelled) => break,
                Err(QueueError::Full) => continue,
            };

            tracing::debug!(
                worker_id = self.id,
                request_id = %request.id,
                image = %request.image_ref,
                "Worker picked up request"
            );

            self.counters.in_flight.fetch_add(1, Ordering::Relaxed);
            self.execute(request).await;
            self.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
            self.counters.processed.fetch_add(1, Ordering::Relaxed);
        }

        tracing::debug!(worker_id = self.id, "Worker stopped");
    }

    /// Runs one scan in its own task so a panic stays contained.
    ///
    /// At the deadline the scan's token is cancelled and the handler gets
    /// [`CANCEL_GRACE`] to wind down before it is dropped.
    async fn execute(&self, request: ScanRequest) {
        let handler = Arc::clone(&self.handler);
        let deadline = self.scan_deadline;
        let request_id = request.id.clone();

        let task = tokio::spawn(async move {
            let scan_cancel = CancellationToken::new();
            let pending = request.clone();
            let scan = handler.handle(request, scan_cancel.clone());
            tokio::pin!(scan);

            tokio::select! {
                _ = &mut scan => return,
                _ = tokio::time::sleep(deadline) => {}
            }

            scan_cancel.cancel();
            if tokio::time::timeout(CANCEL_GRACE, &mut scan).await.is_err() {
                tracing::warn!(
                    request_id = %pending.id,
                    grace_ms = CANCEL_GRACE.as_millis() as u64,
                    "Scan ignored cancellation; dropping it"
                );
            }
            handler.deadline_exceeded(pending, deadline).await;
        });

        if let Err(err) = task.await {
            if err.is_panic() {
                self.counters.panics.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    worker_id = self.id,
                    request_id = %request_id,
                    "Scan handler panicked; worker continues"
                );
            } else {
                tracing::warn!(
                    worker_id = self.id,
                    request_id = %request_id,
                    error = %err,
                    "Scan task was cancelled"
                );
            }
        }
    }
}
