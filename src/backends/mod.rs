//! Scan backend implementations.
//!
//! This module contains implementations of the [`ScanBackend`] trait, one
//! per execution strategy.
//!
//! ## Available Backends
//!
//! - [`mock`] - A scripted backend for tests and demos
//! - [`process`] - Runs a scanner executable per image (requires `process` feature)
//! - [`remote`] - Drives a remote asynchronous scanning API (requires `remote` feature)
//!
//! ## Implementing a Custom Backend
//!
//! ```rust,ignore
//! use scanrelay::core::{ScanBackend, ScanError, ScanFailure, ScanRequest, ScanResult, ScanStatus};
//! use async_trait::async_trait;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug)]
//! pub struct MyBackend;
//!
//! #[async_trait]
//! impl ScanBackend for MyBackend {
//!     fn backend_type(&self) -> &str {
//!         "my-backend"
//!     }
//!
//!     async fn scan(
//!         &self,
//!         request: &ScanRequest,
//!         cancel: CancellationToken,
//!     ) -> Result<ScanResult, ScanFailure> {
//!         // Observe `cancel` at every await point.
//!         todo!()
//!     }
//!
//!     fn validate_config(&self) -> Result<(), ScanError> {
//!         Ok(())
//!     }
//! }
//! ```
//!
//! [`ScanBackend`]: crate::core::ScanBackend

pub mod mock;

#[cfg(feature = "process")]
pub mod process;

#[cfg(feature = "remote")]
pub mod remote;

// Re-exports
pub use mock::{MockBackend, MockOutcome};

#[cfg(feature = "process")]
pub use process::{ProcessBackend, ProcessBackendConfig};

#[cfg(feature = "remote")]
pub use remote::{RemoteBackend, RemoteBackendConfig};
