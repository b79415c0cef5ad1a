//! # relay-protocol: event model for the relay streaming core
//!
//! Shared types consumed by the broadcaster, the connection handler and the
//! HTTP surface. Kept free of runtime dependencies (no tokio, no axum) so it
//! can sit underneath every other crate in the workspace.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (SessionId, RunId, EventId, ClientId)
//! - [`event`]: `AgentEvent` sum type, `EventMeta`, envelope/subtask/input variants
//! - [`event_types`]: dotted event-type vocabulary
//! - [`attachment`]: `Attachment`, `PreviewAsset`
//! - [`payload`]: closed `PayloadValue`, node and workflow snapshots
//! - [`ports`]: collaborator ports (run tracker, stream metrics)
//! - [`error`]: RelayError, RelayResult

pub mod attachment;
pub mod error;
pub mod event;
pub mod event_types;
pub mod ids;
pub mod payload;
pub mod ports;

pub use attachment::{Attachment, AttachmentMap, PreviewAsset};
pub use error::{RelayError, RelayResult};
pub use event::{
    AgentEvent, AgentLevel, ENVELOPE_VERSION, EventMeta, InputReceivedEvent, SubtaskEvent,
    SubtaskMetadata, WorkflowEventEnvelope,
};
pub use ids::{ClientId, EventId, RunId, SessionId};
pub use payload::{NodeSnapshot, PayloadMap, PayloadValue, WorkflowSnapshot};
pub use ports::{MessageStatus, NoopStreamMetrics, RunTracker, StreamMetrics};
