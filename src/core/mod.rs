//! Core types and traits for the scanrelay library.
//!
//! This module provides the fundamental building blocks used throughout
//! the library:
//!
//! - [`types`] - `ScanRequest`, `ScanStatus`, vulnerability counts, credentials
//! - [`traits`] - The `ScanBackend` trait
//! - [`error`] - Structured error types
//! - [`result`] - `ScanResult` and `ScanFailure`
//! - [`key`] - Deduplication key derivation

pub mod error;
pub mod key;
pub mod result;
pub mod traits;
pub mod types;

// Re-export commonly used types at the core level
pub use error::{DispatchError, QueueError, ScanError};
pub use key::dedup_key;
pub use result::{ScanFailure, ScanResult};
pub use traits::{ArcBackend, ScanBackend};
pub use types::{RegistryCredentials, ScanRequest, ScanStatus, VulnerabilityCounts};
