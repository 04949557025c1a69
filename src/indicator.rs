//! Fire-and-forget status signalling.
//!
//! On the flight computer these drive status LEDs; here they are a trait so
//! the pipeline never depends on how (or whether) the signal is shown.
//! Implementations must not block and cannot fail.

use std::sync::Arc;

/// What the logger is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    /// A chunk is about to be written.
    Writing,
    /// A chunk was written.
    Written,
    /// A chunk arrived while storage was unhealthy.
    Fault,
    /// A remount sequence is starting.
    Recovering,
}

/// Receiver of status events.
pub trait StatusIndicator {
    /// Show `event`. Must return promptly.
    fn signal(&self, event: StatusEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopIndicator;

impl StatusIndicator for NoopIndicator {
    fn signal(&self, _event: StatusEvent) {}
}

/// Emits each event as a trace-level `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingIndicator;

impl StatusIndicator for TracingIndicator {
    fn signal(&self, event: StatusEvent) {
        tracing::trace!(target: "flight_logger::status", ?event, "status");
    }
}

impl<T: StatusIndicator + ?Sized> StatusIndicator for Arc<T> {
    fn signal(&self, event: StatusEvent) {
        (**self).signal(event);
    }
}
