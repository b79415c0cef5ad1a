//! # relay-stream: streaming connection core
//!
//! One [`StreamHandler`] is shared by every connection; each call to
//! [`StreamHandler::serve`] owns its own dedup state and runs until the
//! client goes away, a write fails, or the cancellation token fires.
//!
//! ## Module Overview
//!
//! - [`request`]: query validation (session id, replay mode, debug flag)
//! - [`filter`]: event admission (allow-lists, blocked nodes, delegation anchors)
//! - [`guard`]: per-run seq ordering and event-id dedup
//! - [`sanitize`]: wire JSON rendering, attachment normalization, redaction
//! - [`sink`]: `FrameSink` transport abstraction and frame encoding
//! - [`connection`]: the handshake/replay/steady-state loop

pub mod connection;
pub mod error;
pub mod filter;
pub mod guard;
pub mod request;
pub mod sanitize;
pub mod sink;

use std::time::Duration;

pub use connection::{CloseReason, StreamHandler};
pub use error::{StreamError, StreamResult};
pub use filter::{is_delegation_tool_event, should_stream};
pub use guard::DeliveryGuard;
pub use request::{ConnectionRequest, ReplayMode, StreamQuery, validate_session_id};
pub use sanitize::{ConnectionCaches, INLINE_RETENTION_LIMIT, REDACTED, Sanitizer};
pub use sink::{ChannelSink, FrameSink, HEARTBEAT_FRAME, encode_event_frame};

/// Tunables for streaming connections.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Frames buffered between the connection loop and the transport.
    pub channel_capacity: usize,
    pub heartbeat_interval: Duration,
    /// Send only the appended suffix of a growing final answer.
    pub stream_deltas: bool,
    pub seen_event_capacity: usize,
    pub run_seq_capacity: usize,
    pub sent_attachment_capacity: usize,
    pub final_answer_capacity: usize,
    pub max_session_id_len: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
            heartbeat_interval: Duration::from_secs(30),
            stream_deltas: true,
            seen_event_capacity: 10_000,
            run_seq_capacity: 2_048,
            sent_attachment_capacity: 512,
            final_answer_capacity: 256,
            max_session_id_len: 128,
        }
    }
}
