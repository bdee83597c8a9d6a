//! Scan result structures.
//!
//! A [`ScanResult`] is created by a backend when a scan starts and finalized
//! when it ends. Ordinary scan failures are reported as a [`ScanFailure`],
//! which carries both the finalized result and the error the retry policy
//! consumes.

use crate::core::error::ScanError;
use crate::core::types::{ScanRequest, ScanStatus, VulnerabilityCounts};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Maximum number of bytes kept from each captured output stream.
pub const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;

/// The outcome of one scan attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    /// Identifier of the originating request.
    pub request_id: String,

    /// Image reference that was scanned.
    pub image_ref: String,

    /// Type identifier of the backend that ran the scan.
    pub backend: String,

    /// Status of the attempt.
    pub status: ScanStatus,

    /// Process exit code (process backend).
    pub exit_code: Option<i32>,

    /// Last protocol status observed (remote backend).
    pub protocol_status: Option<String>,

    /// Scan identifier assigned by a remote service.
    pub remote_scan_id: Option<String>,

    /// Captured standard output.
    #[serde(default)]
    pub stdout: String,

    /// Captured standard error.
    #[serde(default)]
    pub stderr: String,

    /// Vulnerability counts, when the backend reports them.
    pub vulnerabilities: Option<VulnerabilityCounts>,

    /// When the scan started.
    pub started_at: DateTime<Utc>,

    /// When the scan was finalized.
    pub completed_at: Option<DateTime<Utc>>,

    /// How long the scan took.
    #[serde(with = "duration_serde")]
    pub duration: Duration,

    /// Human-readable error, for failed attempts.
    pub error: Option<String>,

    /// Additional backend-specific details.
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
}

impl ScanResult {
    /// Creates a running result for the given request.
    pub fn start(request: &ScanRequest, backend: impl Into<String>) -> Self {
        Self {
            request_id: request.id.clone(),
            image_ref: request.image_ref.clone(),
            backend: backend.into(),
            status: ScanStatus::Running,
            exit_code: None,
            protocol_status: None,
            remote_scan_id: None,
            stdout: String::new(),
            stderr: String::new(),
            vulnerabilities: None,
            started_at: Utc::now(),
            completed_at: None,
            duration: Duration::ZERO,
            error: None,
            details: HashMap::new(),
        }
    }

    /// Finalizes the result with the given status.
    pub fn finish(mut self, status: ScanStatus) -> Self {
        let now = Utc::now();
        self.status = status;
        self.duration = (now - self.started_at).to_std().unwrap_or_default();
        self.completed_at = Some(now);
        self
    }

    /// Finalizes the result as a failure and pairs it with its error.
    pub fn fail(mut self, status: ScanStatus, error: ScanError) -> ScanFailure {
        self.error = Some(error.to_string());
        ScanFailure {
            result: Box::new(self.finish(status)),
            error,
        }
    }

    /// Returns `true` if the scan succeeded.
    pub fn is_success(&self) -> bool {
        self.status == ScanStatus::Success
    }

    /// Returns `true` once the result has been finalized.
    pub fn is_finalized(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Sets captured output, truncating each stream.
    pub fn with_output(mut self, stdout: &[u8], stderr: &[u8]) -> Self {
        self.stdout = truncate_output(stdout);
        self.stderr = truncate_output(stderr);
        self
    }

    /// Adds a detail entry.
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// A failed scan attempt: the finalized result plus the classified error.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ScanFailure {
    /// The finalized result (status `failed` or `timeout`).
    pub result: Box<ScanResult>,
    /// The error, consumed by the retry policy.
    #[source]
    pub error: ScanError,
}

impl ScanFailure {
    /// Returns the status of the failed attempt.
    pub fn status(&self) -> ScanStatus {
        self.result.status
    }
}

fn truncate_output(bytes: &[u8]) -> String {
    let end = bytes.len().min(MAX_CAPTURED_OUTPUT);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Serde helper for Duration serialization as integer milliseconds.
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_and_finish() {
        let request = ScanRequest::new("nginx:latest", "harbor");
        let result = ScanResult::start(&request, "process");

        assert_eq!(result.status, ScanStatus::Running);
        assert_eq!(result.request_id, request.id);
        assert!(!result.is_finalized());

        let result = result.finish(ScanStatus::Success);
        assert!(result.is_success());
        assert!(result.is_finalized());
        assert!(result.completed_at.unwrap() >= result.started_at);
    }

    #[test]
    fn test_fail_records_error() {
        let request = ScanRequest::new("nginx:latest", "harbor");
        let failure = ScanResult::start(&request, "remote")
            .fail(ScanStatus::Timeout, ScanError::timeout("remote", Duration::from_secs(1)));

        assert_eq!(failure.status(), ScanStatus::Timeout);
        assert!(failure.result.error.as_deref().unwrap().contains("timed out"));
        assert!(failure.to_string().contains("timed out"));
    }

    #[test]
    fn test_output_truncated() {
        let request = ScanRequest::new("nginx:latest", "harbor");
        let big = vec![b'a'; MAX_CAPTURED_OUTPUT + 10];
        let result = ScanResult::start(&request, "process").with_output(&big, b"warn");
        assert_eq!(result.stdout.len(), MAX_CAPTURED_OUTPUT);
        assert_eq!(result.stderr, "warn");
    }

    #[test]
    fn test_serialize_duration_as_millis() {
        let request = ScanRequest::new("nginx:latest", "harbor");
        let mut result = ScanResult::start(&request, "process");
        result.duration = Duration::from_millis(1500);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration"], 1500);
        assert_eq!(json["status"], "running");
    }
}
