//! Core types used throughout the scanrelay library.
//!
//! This module defines the request that travels through the dispatch
//! pipeline, the status lifecycle of a scan attempt, vulnerability counts
//! reported by backends, and registry credentials.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default retry ceiling stamped on new requests.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A request to scan one image.
///
/// Created by intake (one per affected image in a push notification) and
/// owned by exactly one party at a time: the queue, a worker, or the retry
/// scheduler. Only the retry policy mutates it, through
/// [`ScanRequest::increment_retry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    /// Unique identifier for this request.
    pub id: String,

    /// Image reference, e.g. `registry.example.com/team/app:1.4`.
    pub image_ref: String,

    /// Name of the registry that sent the notification.
    pub registry: String,

    /// Content digest (`sha256:...`), when the notification carried one.
    pub digest: Option<String>,

    /// Number of retries already scheduled for this request.
    pub retry_count: u32,

    /// Retry ceiling for this request.
    pub max_retries: u32,

    /// When intake received the request.
    pub received_at: DateTime<Utc>,

    /// When the request was last put on the queue.
    pub enqueued_at: Option<DateTime<Utc>>,
}

impl ScanRequest {
    /// Creates a new request for the given image and registry.
    pub fn new(image_ref: impl Into<String>, registry: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            image_ref: image_ref.into(),
            registry: registry.into(),
            digest: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            received_at: Utc::now(),
            enqueued_at: None,
        }
    }

    /// Sets the content digest.
    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        let digest = digest.into();
        self.digest = if digest.is_empty() { None } else { Some(digest) };
        self
    }

    /// Sets the retry ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Records that the request was just put on the queue.
    pub fn mark_enqueued(&mut self) {
        self.enqueued_at = Some(Utc::now());
    }

    /// Increments the retry counter and returns the new value.
    pub fn increment_retry(&mut self) -> u32 {
        self.retry_count = self.retry_count.saturating_add(1);
        self.retry_count
    }

    /// Returns `true` once the retry counter has reached the ceiling.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Lifecycle status of one scan attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    /// Created, not yet started.
    Pending,
    /// Backend is executing the scan.
    Running,
    /// Scan finished; findings (if any) are recorded on the result.
    Success,
    /// Scan failed.
    Failed,
    /// Scan exceeded its deadline.
    Timeout,
    /// Scan failed and has been handed to the retry scheduler.
    Retrying,
}

impl ScanStatus {
    /// Returns `true` for `success`, `failed` and `timeout`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Timeout)
    }

    /// Returns the wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Retrying => "retrying",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vulnerability counts by severity, as reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VulnerabilityCounts {
    /// Critical findings.
    #[serde(default)]
    pub critical: u32,
    /// High findings.
    #[serde(default)]
    pub high: u32,
    /// Medium findings.
    #[serde(default)]
    pub medium: u32,
    /// Low findings.
    #[serde(default)]
    pub low: u32,
}

impl VulnerabilityCounts {
    /// Total number of findings.
    pub fn total(&self) -> u64 {
        [self.critical, self.high, self.medium, self.low]
            .iter()
            .map(|&n| u64::from(n))
            .sum()
    }
}

/// Registry credentials handed to a backend.
///
/// The password never appears in `Debug` output.
#[derive(Clone)]
pub struct RegistryCredentials {
    /// Registry user name.
    pub username: String,
    /// Registry password or token.
    pub password: SecretString,
}

impl RegistryCredentials {
    /// Creates a new set of credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::new(password.into().into()),
        }
    }
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}
