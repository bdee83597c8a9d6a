//! Error types for the scanrelay library.
//!
//! Backends report failures as [`ScanError`]; the queue reports
//! [`QueueError`]; the dispatch layer (intake, retry scheduling, shutdown)
//! reports [`DispatchError`]. The library never panics on these paths; all
//! errors are returned as `Result` values.

use std::time::Duration;
use thiserror::Error;

/// The main error type for scan execution.
///
/// Display strings are part of the contract: the retry policy classifies
/// errors by matching on their rendered message, so each variant names the
/// failure in plain words (timeouts say "timed out", HTTP failures carry the
/// numeric status code).
#[derive(Debug, Error)]
pub enum ScanError {
    /// The backend is unavailable or not responding.
    #[error("backend '{backend}' is unavailable: {reason}")]
    BackendUnavailable {
        /// Name of the backend that is unavailable.
        backend: String,
        /// Human-readable reason for unavailability.
        reason: String,
    },

    /// The scan operation timed out.
    #[error("scan timed out after {elapsed:?} on backend '{backend}'")]
    Timeout {
        /// Name of the backend that timed out.
        backend: String,
        /// How long the operation ran before timing out.
        elapsed: Duration,
    },

    /// Failed to reach the backend over the network.
    #[error("connection to backend '{backend}' failed: {message}")]
    ConnectionFailed {
        /// Name of the backend.
        backend: String,
        /// Error message describing the failure.
        message: String,
    },

    /// The backend answered with a status code the protocol does not expect.
    #[error("backend '{backend}' returned unexpected HTTP status {status}: {body}")]
    UnexpectedStatus {
        /// Name of the backend.
        backend: String,
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// Rate limit exceeded for the backend.
    #[error("rate limit exceeded (HTTP 429) for backend '{backend}': retry after {retry_after:?}")]
    RateLimited {
        /// Name of the backend.
        backend: String,
        /// Server-dictated wait time before retry.
        retry_after: Option<Duration>,
    },

    /// Authentication failed for the backend.
    #[error("authentication failed for backend '{backend}': {reason}")]
    AuthenticationFailed {
        /// Name of the backend.
        backend: String,
        /// Reason for authentication failure.
        reason: String,
    },

    /// The backend returned a response that could not be parsed.
    #[error("malformed response from backend '{backend}': {details}")]
    MalformedResponse {
        /// Name of the backend.
        backend: String,
        /// Details about what was wrong.
        details: String,
    },

    /// The remote scan reached its `failed` state.
    #[error("remote scan '{scan_id}' failed: {message}")]
    RemoteScanFailed {
        /// Identifier assigned by the remote service.
        scan_id: String,
        /// Error message reported by the remote service.
        message: String,
    },

    /// A remote scan did not finish before the per-scan timeout.
    #[error("remote scan '{scan_id}' timed out after {elapsed:?} ({attempts} poll attempts)")]
    PollTimeout {
        /// Identifier assigned by the remote service.
        scan_id: String,
        /// Number of status requests made.
        attempts: u32,
        /// Time spent waiting.
        elapsed: Duration,
    },

    /// The scanner process exited outside the success and findings range.
    #[error("scanner process {}: {stderr}", exit_description(.exit_code))]
    ProcessFailed {
        /// Exit code, `None` when the process was killed by a signal.
        exit_code: Option<i32>,
        /// Captured standard error, truncated.
        stderr: String,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The scan was cancelled.
    #[error("scan was cancelled")]
    Cancelled,

    /// An internal error occurred.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },

    /// Configuration error.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Description of the configuration error.
        message: String,
    },
}

fn exit_description(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exited with code {}", code),
        None => "was killed by a signal".to_string(),
    }
}

impl ScanError {
    /// Returns `true` if this error is transient by type.
    ///
    /// This is the typed view of the failure. The dispatch-level retry
    /// policy works on rendered messages so that errors from any source can
    /// be classified; see [`crate::manager::RetryPolicy::classify`].
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout { .. }
            | Self::PollTimeout { .. }
            | Self::ConnectionFailed { .. }
            | Self::RateLimited { .. }
            | Self::BackendUnavailable { .. } => true,
            Self::UnexpectedStatus { status, .. } => matches!(status, 500 | 502 | 503 | 504),
            _ => false,
        }
    }

    /// Returns the backend name if this error is associated with one.
    pub fn backend(&self) -> Option<&str> {
        match self {
            Self::BackendUnavailable { backend, .. }
            | Self::Timeout { backend, .. }
            | Self::ConnectionFailed { backend, .. }
            | Self::UnexpectedStatus { backend, .. }
            | Self::RateLimited { backend, .. }
            | Self::AuthenticationFailed { backend, .. }
            | Self::MalformedResponse { backend, .. } => Some(backend),
            _ => None,
        }
    }

    /// Creates a `BackendUnavailable` error.
    pub fn backend_unavailable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `Timeout` error.
    pub fn timeout(backend: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            backend: backend.into(),
            elapsed,
        }
    }

    /// Creates a `ConnectionFailed` error.
    pub fn connection_failed(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Creates a `MalformedResponse` error.
    pub fn malformed(backend: impl Into<String>, details: impl Into<String>) -> Self {
        Self::MalformedResponse {
            backend: backend.into(),
            details: details.into(),
        }
    }

    /// Creates an `Internal` error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a `Configuration` error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

/// Error type for queue operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue is at capacity.
    #[error("queue full")]
    Full,

    /// The queue has been closed.
    #[error("queue closed")]
    Closed,

    /// The caller's cancellation signal fired.
    #[error("queue operation cancelled")]
    Cancelled,
}

/// Error type for the dispatch layer.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The request was not accepted by intake.
    #[error("scan request rejected: {reason}")]
    Rejected {
        /// Caller-visible reason, e.g. "queue full".
        reason: String,
    },

    /// A queue operation failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A retry could not be put back on the queue.
    #[error("failed to requeue request '{request_id}': {reason}")]
    RequeueFailed {
        /// The request that could not be requeued.
        request_id: String,
        /// Why the requeue failed.
        reason: String,
    },

    /// In-flight scans did not finish within the shutdown timeout.
    #[error("shutdown timed out after {timeout:?} waiting for in-flight scans")]
    ShutdownTimedOut {
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// A backend or configuration error surfaced at the dispatch layer.
    #[error(transparent)]
    Scan(#[from] ScanError),
}

impl DispatchError {
    /// Creates a `Rejected` error.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_error_is_recoverable() {
        let timeout = ScanError::timeout("process", Duration::from_secs(30));
        assert!(timeout.is_recoverable());

        let unavailable = ScanError::UnexpectedStatus {
            backend: "remote".into(),
            status: 503,
            body: String::new(),
        };
        assert!(unavailable.is_recoverable());

        let auth = ScanError::AuthenticationFailed {
            backend: "remote".into(),
            reason: "bad token".into(),
        };
        assert!(!auth.is_recoverable());
    }

    #[test]
    fn test_scan_error_backend() {
        let err = ScanError::backend_unavailable("remote", "service not running");
        assert_eq!(err.backend(), Some("remote"));
        assert_eq!(ScanError::Cancelled.backend(), None);
    }

    #[test]
    fn test_display_carries_status_code() {
        let err = ScanError::UnexpectedStatus {
            backend: "remote".into(),
            status: 404,
            body: "no such image".into(),
        };
        assert!(err.to_string().contains("404"));
        assert!(ScanError::timeout("process", Duration::from_secs(1))
            .to_string()
            .contains("timed out"));
    }

    #[test]
    fn test_process_failure_display() {
        let exited = ScanError::ProcessFailed {
            exit_code: Some(42),
            stderr: "boom".into(),
        };
        assert_eq!(exited.to_string(), "scanner process exited with code 42: boom");

        let killed = ScanError::ProcessFailed {
            exit_code: None,
            stderr: String::new(),
        };
        assert!(killed.to_string().contains("killed by a signal"));
    }

    #[test]
    fn test_queue_error_converts() {
        let err: DispatchError = QueueError::Full.into();
        assert_eq!(err.to_string(), "queue full");
    }
}
