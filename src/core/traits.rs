//! Core traits for the scanrelay library.
//!
//! This module defines the `ScanBackend` trait that every execution
//! strategy implements.

use crate::core::error::ScanError;
use crate::core::result::{ScanFailure, ScanResult};
use crate::core::types::ScanRequest;

use async_trait::async_trait;
use std::fmt::Debug;
use tokio_util::sync::CancellationToken;

/// A scan execution strategy.
///
/// The contract is deliberately narrow: run a scan, name yourself, check
/// your configuration. Backend-specific needs stay inside each
/// implementation.
///
/// # Implementation Notes
///
/// - Implementations must be `Send + Sync` for use by concurrent workers.
/// - Ordinary scan failures are returned as [`ScanFailure`], never as panics.
/// - `cancel` must be observed at every blocking point. Backends that own
///   external resources (child processes) release them on every exit path.
///
/// # Example Implementation
///
/// ```rust,ignore
/// use scanrelay::core::{ScanBackend, ScanError, ScanFailure, ScanRequest, ScanResult, ScanStatus};
/// use async_trait::async_trait;
/// use tokio_util::sync::CancellationToken;
///
/// #[derive(Debug)]
/// struct AlwaysClean;
///
/// #[async_trait]
/// impl ScanBackend for AlwaysClean {
///     fn backend_type(&self) -> &str {
///         "always-clean"
///     }
///
///     async fn scan(
///         &self,
///         request: &ScanRequest,
///         _cancel: CancellationToken,
///     ) -> Result<ScanResult, ScanFailure> {
///         Ok(ScanResult::start(request, self.backend_type()).finish(ScanStatus::Success))
///     }
///
///     fn validate_config(&self) -> Result<(), ScanError> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ScanBackend: Send + Sync + Debug {
    /// Returns the stable type identifier of this backend, e.g. "process".
    fn backend_type(&self) -> &str;

    /// Scans the image named by `request`.
    ///
    /// # Returns
    ///
    /// * `Ok(ScanResult)` - the scan ran; status is `success`.
    /// * `Err(ScanFailure)` - the scan failed or timed out; the failure
    ///   carries the finalized result and the error for retry
    ///   classification.
    async fn scan(
        &self,
        request: &ScanRequest,
        cancel: CancellationToken,
    ) -> Result<ScanResult, ScanFailure>;

    /// Validates the backend configuration.
    ///
    /// Configuration errors are fatal at startup and never retried.
    fn validate_config(&self) -> Result<(), ScanError>;
}

/// An arc-wrapped backend for shared ownership.
pub type ArcBackend = std::sync::Arc<dyn ScanBackend>;
