//! Dispatch event records and the sinks that receive them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;

/// The state transition an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A request entered the queue.
    RequestEnqueued,
    /// Intake refused a request.
    RequestRejected,
    /// A worker took a request off the queue.
    RequestDequeued,
    /// A backend began scanning.
    ScanStarted,
    /// A scan finished successfully.
    ScanCompleted,
    /// A scan failed.
    ScanFailed,
    /// A scan ran past its timeout or deadline.
    ScanTimeout,
    /// A failed request was scheduled for another attempt.
    ScanRetried,
    /// A request ran out of retries.
    ScanExhausted,
    /// A request was discarded without a scan outcome.
    RequestDropped,
    /// Intake suppressed a duplicate.
    CacheHit,
    /// Intake saw a new image.
    CacheMiss,
    /// Snapshot of the queue depth.
    QueueDepth,
}

impl EventKind {
    /// Returns the snake_case event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestEnqueued => "request_enqueued",
            Self::RequestRejected => "request_rejected",
            Self::RequestDequeued => "request_dequeued",
            Self::ScanStarted => "scan_started",
            Self::ScanCompleted => "scan_completed",
            Self::ScanFailed => "scan_failed",
            Self::ScanTimeout => "scan_timeout",
            Self::ScanRetried => "scan_retried",
            Self::ScanExhausted => "scan_exhausted",
            Self::RequestDropped => "request_dropped",
            Self::CacheHit => "cache_hit",
            Self::CacheMiss => "cache_miss",
            Self::QueueDepth => "queue_depth",
        }
    }

    /// Returns true for events that end a request's life.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ScanCompleted | Self::ScanExhausted | Self::RequestDropped
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A plain key/value record of one state transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchEvent {
    /// What happened.
    pub kind: EventKind,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Facts about the transition, in insertion order.
    pub fields: Vec<(&'static str, String)>,
}

impl DispatchEvent {
    /// Creates an event stamped with the current time.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            fields: Vec::new(),
        }
    }

    /// Appends a field.
    pub fn with(mut self, key: &'static str, value: impl ToString) -> Self {
        self.fields.push((key, value.to_string()));
        self
    }

    /// Looks up the first field with the given key.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for DispatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for (key, value) in &self.fields {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}

/// Receives dispatch events.
///
/// Implementations must not block; they are called from the intake path and
/// from workers.
pub trait EventSink: Send + Sync + fmt::Debug {
    /// Records one event.
    fn emit(&self, event: DispatchEvent);
}

/// Forwards events to `tracing` under the `scanrelay::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: DispatchEvent) {
        let fields = event
            .fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");

        match event.kind {
            EventKind::ScanFailed | EventKind::ScanTimeout | EventKind::RequestRejected => {
                tracing::warn!(
                    target: "scanrelay::audit",
                    event_type = %event.kind,
                    timestamp = %event.timestamp.to_rfc3339(),
                    fields = %fields,
                    "Dispatch event"
                );
            }
            EventKind::ScanExhausted | EventKind::RequestDropped => {
                tracing::error!(
                    target: "scanrelay::audit",
                    event_type = %event.kind,
                    timestamp = %event.timestamp.to_rfc3339(),
                    fields = %fields,
                    "Dispatch event"
                );
            }
            EventKind::QueueDepth | EventKind::CacheMiss | EventKind::RequestDequeued => {
                tracing::debug!(
                    target: "scanrelay::audit",
                    event_type = %event.kind,
                    timestamp = %event.timestamp.to_rfc3339(),
                    fields = %fields,
                    "Dispatch event"
                );
            }
            _ => {
                tracing::info!(
                    target: "scanrelay::audit",
                    event_type = %event.kind,
                    timestamp = %event.timestamp.to_rfc3339(),
                    fields = %fields,
                    "Dispatch event"
                );
            }
        }
    }
}

/// Keeps every event in memory. Useful in tests.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<DispatchEvent>>,
}

impl MemoryEventSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything recorded so far.
    pub fn events(&self) -> Vec<DispatchEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Returns the recorded events of one kind.
    pub fn of_kind(&self, kind: EventKind) -> Vec<DispatchEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Counts the recorded events of one kind.
    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    /// Removes all recorded events.
    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: DispatchEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: DispatchEvent) {}
}
