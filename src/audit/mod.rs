//! Observability output for the dispatch pipeline.
//!
//! Every state transition is described by a [`DispatchEvent`], a plain
//! key/value record handed to an [`EventSink`]. The default
//! [`TracingEventSink`] emits each record through `tracing` under the
//! `scanrelay::audit` target so any subscriber (JSON file, OpenTelemetry,
//! etc.) can collect it. Counters live in [`metrics`].

mod events;
pub mod metrics;

pub use events::{
    DispatchEvent, EventKind, EventSink, MemoryEventSink, NoopEventSink, TracingEventSink,
};
pub use metrics::{Counter, DispatchMetrics, MetricsSnapshot};
