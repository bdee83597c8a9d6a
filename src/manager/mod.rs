//! The dispatch pipeline.
//!
//! Intake hands requests to the [`ScanDispatcher`], which filters repeats
//! through the [`DedupCache`] and puts the rest on the bounded
//! [`ScanQueue`]. A [`WorkerPool`] drains the queue and runs each request
//! against the configured backend. Failures go to the [`RetryPolicy`],
//! which requeues transient ones after a backoff. The
//! [`ShutdownCoordinator`] tears everything down in order.

mod dedup;
mod dispatcher;
mod pool;
mod queue;
mod retry;
mod shutdown;

pub use dedup::{DedupCache, DedupStats};
pub use dispatcher::{DispatchStats, EnqueueOutcome, ScanDispatcher, ScanDispatcherBuilder};
pub use pool::{PoolStats, ScanHandler, WorkerPool};
pub use queue::ScanQueue;
pub use retry::{RetryConfig, RetryPolicy};
pub use shutdown::{RetryTracker, ShutdownCoordinator, ShutdownReport};
