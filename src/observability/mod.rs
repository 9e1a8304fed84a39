//! Observability for the replication core
//!
//! This module provides:
//! - Structured logging (JSON lines)
//! - Monotonic replication counters
//! - Typed lifecycle events
//!
//! # Principles
//!
//! 1. Observability is read-only
//! 2. No side effects on replication state
//! 3. No background threads
//! 4. Deterministic output
//!
//! # Usage
//!
//! ```ignore
//! use segrep::observability::{log_event_with_fields, Event, ObservationScope};
//!
//! log_event_with_fields(Event::SegmentOpened, &[("segment", "5")]);
//!
//! let scope = ObservationScope::new(Event::Sync.as_str());
//! // ... drive replication ...
//! scope.complete();
//! ```

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{Logger, Severity, LOG_LEVEL_ENV};
pub use metrics::{MetricsRegistry, MetricsSnapshot, RpcKind};
pub use scope::ObservationScope;

/// Log a lifecycle event at its default severity
pub fn log_event(event: Event) {
    Logger::log(event.severity(), event.as_str(), &[]);
}

/// Log a lifecycle event with fields at its default severity
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}
