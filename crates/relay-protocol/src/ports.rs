//! Collaborator ports consumed by the streaming core.
//!
//! Both traits are synchronous and fire-and-forget: implementations must not
//! block the caller, and failures stay inside the implementation.

use std::time::Duration;

use crate::ids::{RunId, SessionId};

/// Resolves the run currently executing for a session.
pub trait RunTracker: Send + Sync {
    fn active_run_id(&self, session_id: &SessionId) -> Option<RunId>;
}

/// Outcome label attached to every recorded stream message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Ok,
    WriteError,
    SerializationError,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::WriteError => "write_error",
            Self::SerializationError => "serialization_error",
        }
    }
}

/// Observability sink for streaming connections.
pub trait StreamMetrics: Send + Sync {
    fn record_message(&self, event_type: &str, status: MessageStatus, bytes: usize);
    fn increment_connections(&self);
    fn decrement_connections(&self);
    fn record_connection_duration(&self, duration: Duration);
}

/// Discards every measurement.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStreamMetrics;

impl StreamMetrics for NoopStreamMetrics {
    fn record_message(&self, _event_type: &str, _status: MessageStatus, _bytes: usize) {}
    fn increment_connections(&self) {}
    fn decrement_connections(&self) {}
    fn record_connection_duration(&self, _duration: Duration) {}
}
