//! # Scanrelay
//!
//! A scan dispatch pipeline for container registry push notifications.
//!
//! ## Overview
//!
//! Scanrelay sits between a registry's push events and a vulnerability
//! scanner. It lets you:
//!
//! - Accept scan requests through a non-blocking intake with backpressure
//! - Suppress repeated scans of the same image inside a TTL window
//! - Run scans on a fixed pool of workers with a per-scan deadline
//! - Retry transient failures with capped exponential backoff
//! - Plug in scanners: a local executable or a remote scanning API
//! - Shut down gracefully, accounting for every request still pending
//! - Emit structured audit events and counters for every transition
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use scanrelay::{DispatchConfig, ScanDispatcher, ScanRequest};
//! use scanrelay::backends::MockBackend;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dispatcher = ScanDispatcher::builder()
//!         .with_backend(MockBackend::new())
//!         .with_config(DispatchConfig::new().with_worker_count(4))
//!         .build()?;
//!     dispatcher.start();
//!
//!     let outcome = dispatcher
//!         .enqueue_scan_request(ScanRequest::new("registry.local/app:1.0", "local"))?;
//!     println!("{:?}", outcome);
//!
//!     let report = dispatcher.shutdown_default().await;
//!     println!("dropped {} pending requests", report.dropped);
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `default` - Enables both real backends
//! - `process` - Local scanner executable backend
//! - `remote` - Remote scanning API backend (pulls in `reqwest`)
//!
//! ## Architecture
//!
//! - **Core**: Requests, results, errors and the backend trait
//! - **Backends**: Individual execution strategies
//! - **Manager**: Queue, dedup, workers, retry and shutdown
//! - **Audit**: Structured events and counters
//! - **Config**: Typed settings with defaults and validation

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod audit;
pub mod backends;
pub mod config;
pub mod core;
pub mod manager;

// Re-export commonly used types at the crate root
pub use crate::core::{
    DispatchError, QueueError, RegistryCredentials, ScanBackend, ScanError, ScanFailure,
    ScanRequest, ScanResult, ScanStatus, VulnerabilityCounts,
};

pub use crate::audit::{DispatchEvent, EventKind, EventSink, TracingEventSink};
pub use crate::config::{BackendTimeouts, DedupConfig, DispatchConfig, QueueConfig, WorkerConfig};
pub use crate::manager::{
    EnqueueOutcome, RetryConfig, ScanDispatcher, ScanDispatcherBuilder, ShutdownReport,
};

/// Prelude module for convenient imports.
///
/// ```rust
/// use scanrelay::prelude::*;
/// ```
pub mod prelude {
    pub use crate::audit::{DispatchEvent, EventKind, EventSink, TracingEventSink};
    pub use crate::config::{BackendTimeouts, DispatchConfig};
    pub use crate::core::{
        DispatchError, ScanBackend, ScanError, ScanFailure, ScanRequest, ScanResult, ScanStatus,
        VulnerabilityCounts,
    };
    pub use crate::manager::{
        EnqueueOutcome, RetryConfig, ScanDispatcher, ShutdownReport,
    };
}
