//! Mock backend for testing.
//!
//! This module provides a configurable backend that simulates scan
//! outcomes without running a scanner, for tests and demos.

use crate::core::{
    ScanBackend, ScanError, ScanFailure, ScanRequest, ScanResult, ScanStatus, VulnerabilityCounts,
};

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What a mock scan does.
#[derive(Debug, Clone, PartialEq)]
pub enum MockOutcome {
    /// Succeed with no findings.
    Success,
    /// Succeed with the given findings.
    Findings(VulnerabilityCounts),
    /// Fail with an error carrying this message.
    Fail(String),
    /// Fail with status `timeout`.
    Timeout,
    /// Block until the scan is cancelled.
    Hang,
    /// Panic inside the scan.
    Panic,
}

impl MockOutcome {
    /// Shorthand for [`MockOutcome::Fail`].
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail(message.into())
    }
}

/// A mock backend for testing purposes.
///
/// Outcomes are picked in this order: the next scripted outcome, the
/// response registered for the image reference, the default outcome.
///
/// # Examples
///
/// ```rust
/// use scanrelay::backends::{MockBackend, MockOutcome};
/// use std::time::Duration;
///
/// // Always succeeds.
/// let backend = MockBackend::new();
///
/// // Fails once, then succeeds.
/// let backend = MockBackend::new()
///     .with_script(vec![MockOutcome::fail("connection refused"), MockOutcome::Success])
///     .with_latency(Duration::from_millis(20));
/// ```
#[derive(Debug)]
pub struct MockBackend {
    name: String,
    script: Mutex<VecDeque<MockOutcome>>,
    responses: HashMap<String, MockOutcome>,
    default_outcome: MockOutcome,
    latency: Option<Duration>,
    scan_count: AtomicU64,
    invalid_config: Option<String>,
}

impl MockBackend {
    /// Creates a mock backend that always succeeds.
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            script: Mutex::new(VecDeque::new()),
            responses: HashMap::new(),
            default_outcome: MockOutcome::Success,
            latency: None,
            scan_count: AtomicU64::new(0),
            invalid_config: None,
        }
    }

    /// Sets the backend type reported by this instance.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Queues outcomes consumed one per scan, in order.
    pub fn with_script(self, outcomes: Vec<MockOutcome>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(outcomes);
        self
    }

    /// Sets the outcome for one image reference.
    pub fn with_response(mut self, image_ref: impl Into<String>, outcome: MockOutcome) -> Self {
        self.responses.insert(image_ref.into(), outcome);
        self
    }

    /// Sets the outcome used when nothing more specific applies.
    pub fn with_default(mut self, outcome: MockOutcome) -> Self {
        self.default_outcome = outcome;
        self
    }

    /// Sets the simulated latency for scans.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes `validate_config` fail with the given message.
    pub fn with_invalid_config(mut self, message: impl Into<String>) -> Self {
        self.invalid_config = Some(message.into());
        self
    }

    /// Returns the number of scans performed.
    pub fn scan_count(&self) -> u64 {
        self.scan_count.load(Ordering::Relaxed)
    }

    fn next_outcome(&self, request: &ScanRequest) -> MockOutcome {
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        scripted
            .or_else(|| self.responses.get(&request.image_ref).cloned())
            .unwrap_or_else(|| self.default_outcome.clone())
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScanBackend for MockBackend {
    fn backend_type(&self) -> &str {
        &self.name
    }

    async fn scan(
        &self,
        request: &ScanRequest,
        cancel: CancellationToken,
    ) -> Result<ScanResult, ScanFailure> {
        self.scan_count.fetch_add(1, Ordering::Relaxed);
        let outcome = self.next_outcome(request);
        let result = ScanResult::start(request, self.name.as_str());

        if let Some(latency) = self.latency {
            tokio::select! {
                _ = tokio::time::sleep(latency) => {}
                _ = cancel.cancelled() => {
                    return Err(result.fail(ScanStatus::Failed, ScanError::Cancelled));
                }
            }
        }

        tracing::debug!(
            request_id = %request.id,
            image = %request.image_ref,
            outcome = ?outcome,
            "Mock scan"
        );

        match outcome {
            MockOutcome::Success => Ok(result.finish(ScanStatus::Success)),
            MockOutcome::Findings(counts) => {
                let mut result = result;
                result.exit_code = Some(1);
                result.vulnerabilities = Some(counts);
                Ok(result.finish(ScanStatus::Success))
            }
            MockOutcome::Fail(message) => {
                Err(result.fail(ScanStatus::Failed, ScanError::internal(message)))
            }
            MockOutcome::Timeout => {
                let elapsed = self.latency.unwrap_or_default();
                Err(result.fail(ScanStatus::Timeout, ScanError::timeout(&self.name, elapsed)))
            }
            MockOutcome::Hang => {
                cancel.cancelled().await;
                Err(result.fail(ScanStatus::Failed, ScanError::Cancelled))
            }
            MockOutcome::Panic => panic!("mock backend panicked scanning {}", request.image_ref),
        }
    }

    fn validate_config(&self) -> Result<(), ScanError> {
        match &self.invalid_config {
            Some(message) => Err(ScanError::configuration(message.clone())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_success() {
        let backend = MockBackend::new();
        let request = ScanRequest::new("app:1.0", "hub");

        let result = backend.scan(&request, CancellationToken::new()).await.unwrap();
        assert!(result.is_success());
        assert!(result.is_finalized());
        assert_eq!(result.backend, "mock");
        assert_eq!(backend.scan_count(), 1);
    }

    #[tokio::test]
    async fn test_script_then_default() {
        let backend = MockBackend::new()
            .with_script(vec![MockOutcome::fail("connection refused")])
            .with_default(MockOutcome::Findings(VulnerabilityCounts {
                critical: 1,
                high: 2,
                medium: 0,
                low: 0,
            }));
        let request = ScanRequest::new("app:1.0", "hub");

        let failure = backend
            .scan(&request, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.status(), ScanStatus::Failed);
        assert!(failure.error.to_string().contains("connection refused"));

        let result = backend.scan(&request, CancellationToken::new()).await.unwrap();
        assert_eq!(result.exit_code, Some(1));
        assert_eq!(result.vulnerabilities.unwrap().total(), 3);
    }

    #[tokio::test]
    async fn test_per_image_response() {
        let backend = MockBackend::new().with_response("bad:1.0", MockOutcome::Timeout);

        let failure = backend
            .scan(&ScanRequest::new("bad:1.0", "hub"), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.status(), ScanStatus::Timeout);

        assert!(backend
            .scan(&ScanRequest::new("good:1.0", "hub"), CancellationToken::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_hang_returns_on_cancel() {
        let backend = MockBackend::new().with_default(MockOutcome::Hang);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let failure = backend
            .scan(&ScanRequest::new("app:1.0", "hub"), cancel)
            .await
            .unwrap_err();
        assert!(matches!(failure.error, ScanError::Cancelled));
    }

    #[test]
    fn test_invalid_config() {
        assert!(MockBackend::new().validate_config().is_ok());
        assert!(MockBackend::new()
            .with_invalid_config("missing scanner path")
            .validate_config()
            .is_err());
    }
}
