//! Time-windowed deduplication of scan requests.
//!
//! A request is a duplicate when a request with the same key (see
//! [`dedup_key`]) was recorded less than `ttl` ago. The check is
//! best-effort: two identical requests racing through the miss path in the
//! same instant may both be admitted.

use crate::core::{dedup_key, ScanRequest};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Hit/miss statistics for the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    /// Requests reported as duplicates.
    pub hits: u64,
    /// Requests recorded as new.
    pub misses: u64,
    /// Entries currently held.
    pub entries: usize,
}

/// Cache of recently seen image identities.
#[derive(Debug)]
pub struct DedupCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, Instant>>,
    hits: AtomicU64,
    misses: AtomicU64,
    stop: CancellationToken,
}

impl DedupCache {
    /// Creates a cache with the given TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stop: CancellationToken::new(),
        }
    }

    /// Returns the configured TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Reports whether `request` was seen within the TTL.
    ///
    /// On a miss the request is recorded as seen now.
    pub fn is_duplicate(&self, request: &ScanRequest) -> bool {
        let key = dedup_key(request);
        let now = Instant::now();

        {
            let entries = self
                .entries
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(seen) = entries.get(&key) {
                if now.duration_since(*seen) < self.ttl {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
            }
        }

        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Another caller may have recorded the key between the two locks.
        if let Some(seen) = entries.get(&key) {
            if now.duration_since(*seen) < self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        }

        entries.insert(key, now);
        self.misses.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Removes the entry recorded under `key` (see [`dedup_key`]), if any.
    ///
    /// Used when a request recorded as new was then refused by the queue,
    /// so a resubmission inside the TTL is not reported as a duplicate.
    pub fn forget(&self, key: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key)
            .is_some()
    }

    /// Removes entries older than the TTL. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = entries.len();
        entries.retain(|_, seen| now.duration_since(*seen) <= self.ttl);
        before - entries.len()
    }

    /// Spawns the background sweep task, waking every TTL/2.
    ///
    /// The task exits when [`DedupCache::stop`] is called.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = (self.ttl / 2).max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cache.stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.sweep();
                        if removed > 0 {
                            tracing::debug!(
                                removed = removed,
                                remaining = cache.len(),
                                "Dedup cache sweep"
                            );
                        }
                    }
                }
            }
            tracing::debug!("Dedup sweeper stopped");
        })
    }

    /// Stops the sweep task. Returns `true` on the first call only.
    pub fn stop(&self) -> bool {
        if self.stop.is_cancelled() {
            return false;
        }
        self.stop.cancel();
        true
    }

    /// Returns true once the cache has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Returns the number of entries held.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Returns true if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns hit/miss statistics.
    pub fn stats(&self) -> DedupStats {
        DedupStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
