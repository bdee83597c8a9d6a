//! Dispatch counters.
//!
//! Counters are relaxed atomics: reads are eventually consistent and no
//! ordering is implied between them. Components hold an
//! `Arc<DispatchMetrics>` and go through [`DispatchMetrics::increment`];
//! the struct's storage is never exposed.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// A named dispatch counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// Requests accepted by intake.
    Enqueued,
    /// Requests refused by intake.
    Rejected,
    /// Requests suppressed as duplicates.
    Duplicates,
    /// Scans that ran to success.
    Completed,
    /// Scans that failed.
    Failed,
    /// Scans that timed out.
    TimedOut,
    /// Requests scheduled for another attempt.
    Retried,
    /// Requests abandoned after the last retry.
    Exhausted,
    /// Requests discarded at shutdown or on requeue failure.
    Dropped,
}

impl Counter {
    const ALL: [Counter; 9] = [
        Counter::Enqueued,
        Counter::Rejected,
        Counter::Duplicates,
        Counter::Completed,
        Counter::Failed,
        Counter::TimedOut,
        Counter::Retried,
        Counter::Exhausted,
        Counter::Dropped,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Requests accepted by intake.
    pub enqueued: u64,
    /// Requests refused by intake.
    pub rejected: u64,
    /// Requests suppressed as duplicates.
    pub duplicates: u64,
    /// Scans that ran to success.
    pub completed: u64,
    /// Scans that failed.
    pub failed: u64,
    /// Scans that timed out.
    pub timed_out: u64,
    /// Requests scheduled for another attempt.
    pub retried: u64,
    /// Requests abandoned after the last retry.
    pub exhausted: u64,
    /// Requests discarded without a scan outcome.
    pub dropped: u64,
}

/// Dispatch counters.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    counters: [AtomicU64; 9],
}

impl DispatchMetrics {
    /// Creates a set of zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one to `counter`.
    pub fn increment(&self, counter: Counter) {
        self.counters[counter.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Reads `counter`.
    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let [enqueued, rejected, duplicates, completed, failed, timed_out, retried, exhausted, dropped] =
            Counter::ALL.map(|c| self.get(c));
        MetricsSnapshot {
            enqueued,
            rejected,
            duplicates,
            completed,
            failed,
            timed_out,
            retried,
            exhausted,
            dropped,
        }
    }
}

static GLOBAL: OnceLock<Arc<DispatchMetrics>> = OnceLock::new();

/// Initializes the process-wide metrics instance.
///
/// Returns the existing instance if it was already initialized.
pub fn init() -> Arc<DispatchMetrics> {
    Arc::clone(GLOBAL.get_or_init(|| Arc::new(DispatchMetrics::new())))
}

/// Returns the process-wide metrics instance, if [`init`] was called.
pub fn global() -> Option<Arc<DispatchMetrics>> {
    GLOBAL.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_and_snapshot() {
        let metrics = DispatchMetrics::new();
        metrics.increment(Counter::Enqueued);
        metrics.increment(Counter::Enqueued);
        metrics.increment(Counter::Exhausted);

        assert_eq!(metrics.get(Counter::Enqueued), 2);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.enqueued, 2);
        assert_eq!(snapshot.exhausted, 1);
        assert_eq!(snapshot.completed, 0);
    }

    #[test]
    fn test_global_is_shared() {
        let a = init();
        let b = init();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(global().is_some());
    }

    #[test]
    fn test_concurrent_increments() {
        let metrics = Arc::new(DispatchMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.increment(Counter::Completed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.get(Counter::Completed), 8000);
    }
}
