//! Dispatch configuration.
//!
//! Every struct here has sensible defaults, `with_*` setters, and derives
//! `Deserialize` with `#[serde(default)]` so an external loader can hydrate
//! it from a partial document. Durations are integer milliseconds on the
//! wire. [`DispatchConfig::validate`] rejects settings the pipeline cannot
//! run with; such errors are fatal at startup.

use crate::core::result::duration_serde;
use crate::core::ScanError;
use crate::manager::RetryConfig;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Top-level configuration for the dispatch pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Queue settings.
    pub queue: QueueConfig,

    /// Worker pool settings.
    pub workers: WorkerConfig,

    /// Requeue-level retry settings.
    pub retry: RetryConfig,

    /// Deduplication settings.
    pub dedup: DedupConfig,

    /// How long shutdown waits for in-flight scans.
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            workers: WorkerConfig::default(),
            retry: RetryConfig::default(),
            dedup: DedupConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DispatchConfig {
    /// Creates a new configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue.capacity = capacity;
        self
    }

    /// Sets the number of workers.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.workers.count = count;
        self
    }

    /// Sets the per-scan deadline enforced by workers.
    pub fn with_scan_deadline(mut self, deadline: Duration) -> Self {
        self.workers.scan_deadline = deadline;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the deduplication configuration.
    pub fn with_dedup(mut self, dedup: DedupConfig) -> Self {
        self.dedup = dedup;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Checks that the configuration is usable.
    pub fn validate(&self) -> Result<(), ScanError> {
        if self.queue.capacity == 0 {
            return Err(ScanError::configuration("queue.capacity must be at least 1"));
        }
        if self.workers.count == 0 {
            return Err(ScanError::configuration("workers.count must be at least 1"));
        }
        if self.workers.scan_deadline.is_zero() {
            return Err(ScanError::configuration(
                "workers.scan_deadline must be greater than zero",
            ));
        }
        if self.dedup.enabled && self.dedup.ttl.is_zero() {
            return Err(ScanError::configuration(
                "dedup.ttl must be greater than zero when dedup is enabled",
            ));
        }
        self.retry.validate()
    }
}

/// Queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of queued requests.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    pub count: usize,

    /// Fixed deadline for a single scan, independent of pool shutdown.
    #[serde(with = "duration_serde")]
    pub scan_deadline: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 5,
            scan_deadline: Duration::from_secs(600),
        }
    }
}

/// Deduplication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Whether intake suppresses repeated requests.
    pub enabled: bool,

    /// Trailing window during which a repeat is a duplicate.
    #[serde(with = "duration_serde")]
    pub ttl: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
        }
    }
}

impl DedupConfig {
    /// Creates a configuration with the given TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { enabled: true, ttl }
    }

    /// Creates a configuration with deduplication turned off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Per-scan timeouts shared by the backends.
///
/// A registry-specific override wins over the global default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendTimeouts {
    /// Timeout used when the registry has no override.
    #[serde(with = "duration_serde")]
    pub default: Duration,

    /// Overrides keyed by registry name, in milliseconds.
    pub per_registry_ms: HashMap<String, u64>,
}

impl BackendTimeouts {
    /// Creates timeouts with the given default.
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            per_registry_ms: HashMap::new(),
        }
    }

    /// Adds a registry-specific override.
    pub fn with_override(mut self, registry: impl Into<String>, timeout: Duration) -> Self {
        self.per_registry_ms
            .insert(registry.into(), timeout.as_millis() as u64);
        self
    }

    /// Resolves the timeout for a registry.
    pub fn for_registry(&self, registry: &str) -> Duration {
        self.per_registry_ms
            .get(registry)
            .map(|ms| Duration::from_millis(*ms))
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(self.default)
    }

    pub(crate) fn validate(&self, backend: &str) -> Result<(), ScanError> {
        if self.default.is_zero() {
            return Err(ScanError::configuration(format!(
                "{} backend timeout must be greater than zero",
                backend
            )));
        }
        Ok(())
    }
}

impl Default for BackendTimeouts {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}
