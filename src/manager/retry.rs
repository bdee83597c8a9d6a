//! Requeue-level retry policy.
//!
//! Backends retry transient transport faults on their own; whatever
//! survives that reaches this policy, which decides between a full requeue
//! with exponential backoff and final abandonment.

use crate::core::result::duration_serde;
use crate::core::{DispatchError, QueueError, ScanError, ScanRequest};
use crate::manager::queue::ScanQueue;

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Message fragments that mark an error as transient.
const RETRIABLE_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "connection failed",
    "network",
    "temporarily unavailable",
    "unavailable",
    "rate limit",
    "429",
    "500",
    "502",
    "503",
    "504",
];

/// Message fragments that mark an error as permanent.
const NON_RETRIABLE_PATTERNS: &[&str] = &[
    "not found",
    "404",
    "401",
    "403",
    "invalid",
    "authentication",
    "authorization",
    "unauthorized",
    "forbidden",
];

/// How often a full queue is re-tried while requeueing.
const REQUEUE_POLL: Duration = Duration::from_millis(100);

/// Configuration for requeue behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retry ceiling stamped on requests that do not carry their own.
    pub max_retries: u32,

    /// Delay before the first retry.
    #[serde(with = "duration_serde")]
    pub initial_backoff: Duration,

    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,

    /// Maximum delay between retries.
    #[serde(with = "duration_serde")]
    pub max_backoff: Duration,

    /// How long a requeue may wait for queue space.
    #[serde(with = "duration_serde")]
    pub requeue_timeout: Duration,

    /// Whether errors matching no known pattern are retried.
    pub retry_unknown_errors: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(60),
            requeue_timeout: Duration::from_secs(5),
            retry_unknown_errors: true,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Disables retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Sets the retry ceiling.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the initial backoff.
    pub fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    /// Sets the maximum backoff.
    pub fn with_max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Sets the requeue timeout.
    pub fn with_requeue_timeout(mut self, timeout: Duration) -> Self {
        self.requeue_timeout = timeout;
        self
    }

    /// Sets whether unrecognized errors are retried.
    pub fn with_retry_unknown_errors(mut self, retry: bool) -> Self {
        self.retry_unknown_errors = retry;
        self
    }

    /// Calculates the delay before retry number `retry_count` (1-based).
    ///
    /// `initial * multiplier^(retry_count - 1)`, capped at `max_backoff`.
    /// No jitter: the same input always yields the same delay.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_backoff.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_backoff
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ScanError> {
        if self.backoff_multiplier < 1.0 || !self.backoff_multiplier.is_finite() {
            return Err(ScanError::configuration(
                "retry.backoff_multiplier must be a finite value >= 1.0",
            ));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(ScanError::configuration(
                "retry.max_backoff must not be smaller than retry.initial_backoff",
            ));
        }
        Ok(())
    }
}

/// Classification of an error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorClass {
    /// Matches a transient pattern.
    Retriable,
    /// Matches a permanent pattern.
    NonRetriable,
    /// Matches neither list.
    Unknown,
}

/// Decides whether failed scans are requeued, and requeues them.
#[derive(Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
    queue: Arc<ScanQueue>,
}

impl RetryPolicy {
    /// Creates a policy that requeues onto `queue`.
    pub fn new(config: RetryConfig, queue: Arc<ScanQueue>) -> Self {
        Self { config, queue }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Classifies an error by its rendered message.
    ///
    /// Permanent patterns are checked first, so a message such as
    /// "invalid token after timeout" is not retried.
    pub(crate) fn classify(message: &str) -> ErrorClass {
        let message = message.to_ascii_lowercase();
        if NON_RETRIABLE_PATTERNS.iter().any(|p| matches_pattern(&message, p)) {
            ErrorClass::NonRetriable
        } else if RETRIABLE_PATTERNS.iter().any(|p| matches_pattern(&message, p)) {
            ErrorClass::Retriable
        } else {
            ErrorClass::Unknown
        }
    }

    /// Returns whether `request` should be retried after `error`.
    pub fn should_retry(&self, request: &ScanRequest, error: &dyn Display) -> bool {
        if request.retries_exhausted() {
            return false;
        }
        match Self::classify(&error.to_string()) {
            ErrorClass::Retriable => true,
            ErrorClass::NonRetriable => false,
            ErrorClass::Unknown => self.config.retry_unknown_errors,
        }
    }

    /// Returns the backoff before retry number `retry_count`.
    pub fn calculate_backoff(&self, retry_count: u32) -> Duration {
        self.config.backoff_for(retry_count)
    }

    /// Increments the retry counter, waits the backoff, then requeues.
    ///
    /// Only the calling task waits; the pool keeps running. Returns the
    /// request as it was put back on the queue.
    ///
    /// # Errors
    ///
    /// `DispatchError::RequeueFailed` when `cancel` fires during the backoff,
    /// the queue is closed, or no space frees up within the requeue timeout.
    pub async fn schedule_retry(
        &self,
        mut request: ScanRequest,
        error: &str,
        cancel: &CancellationToken,
    ) -> Result<ScanRequest, DispatchError> {
        let attempt = request.increment_retry();
        let backoff = self.calculate_backoff(attempt);

        tracing::info!(
            request_id = %request.id,
            image = %request.image_ref,
            retry = attempt,
            max_retries = request.max_retries,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "Scheduling scan retry"
        );

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = cancel.cancelled() => {
                return Err(requeue_failed(&request, "cancelled during backoff"));
            }
        }

        self.requeue(request, cancel).await
    }

    async fn requeue(
        &self,
        request: ScanRequest,
        cancel: &CancellationToken,
    ) -> Result<ScanRequest, DispatchError> {
        let deadline = tokio::time::Instant::now() + self.config.requeue_timeout;

        loop {
            match self.queue.enqueue(request.clone(), cancel) {
                Ok(()) => return Ok(request),
                Err(QueueError::Full) if tokio::time::Instant::now() < deadline => {
                    tokio::select! {
                        _ = tokio::time::sleep(REQUEUE_POLL) => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = cancel.cancelled() => {
                            return Err(requeue_failed(&request, "cancelled while queue was full"));
                        }
                    }
                }
                Err(QueueError::Full) => {
                    return Err(requeue_failed(&request, "queue full until requeue deadline"));
                }
                Err(err) => return Err(requeue_failed(&request, err.to_string())),
            }
        }
    }
}

/// Matches `pattern` in `message`. Status codes only match as whole
/// numbers, so "401" does not match a duration such as "1.401s".
fn matches_pattern(message: &str, pattern: &str) -> bool {
    if !pattern.bytes().all(|b| b.is_ascii_digit()) {
        return message.contains(pattern);
    }
    let bytes = message.as_bytes();
    let is_numeric = |b: u8| b.is_ascii_digit() || b == b'.';
    message.match_indices(pattern).any(|(start, _)| {
        let end = start + pattern.len();
        let before = start == 0 || !is_numeric(bytes[start - 1]);
        let after = end == bytes.len() || !is_numeric(bytes[end]);
        before && after
    })
}

fn requeue_failed(request: &ScanRequest, reason: impl Into<String>) -> DispatchError {
    DispatchError::RequeueFailed {
        request_id: request.id.clone(),
        reason: reason.into(),
    }
}
