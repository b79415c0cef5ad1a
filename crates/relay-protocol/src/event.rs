//! Agent events as produced by the workflow engine.
//!
//! `AgentEvent` is a closed sum type. Every variant exposes the same
//! identity accessors (event type, ids, seq, run linkage); the stream
//! filter and the serializer match on the variant explicitly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attachment::AttachmentMap;
use crate::error::{RelayError, RelayResult};
use crate::event_types;
use crate::ids::{EventId, RunId, SessionId};
use crate::payload::{PayloadMap, PayloadValue};

/// Current envelope schema version.
pub const ENVELOPE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentLevel {
    #[default]
    Core,
    Subagent,
}

impl AgentLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Subagent => "subagent",
        }
    }
}

/// Identity and linkage fields shared by every event variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    #[serde(default)]
    pub event_id: EventId,
    /// Monotonic within `run_id`; 0 means unset.
    #[serde(default)]
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub session_id: SessionId,
    #[serde(default)]
    pub run_id: RunId,
    #[serde(default)]
    pub parent_run_id: RunId,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub causation_id: String,
    #[serde(default)]
    pub agent_level: AgentLevel,
}

impl EventMeta {
    /// Fresh metadata with a random event id and the current timestamp.
    pub fn new(session_id: impl Into<SessionId>) -> Self {
        Self {
            event_id: EventId::new_uuid(),
            seq: 0,
            timestamp: Utc::now(),
            session_id: session_id.into(),
            run_id: RunId::default(),
            parent_run_id: RunId::default(),
            correlation_id: String::new(),
            causation_id: String::new(),
            agent_level: AgentLevel::Core,
        }
    }

    pub fn with_run(mut self, run_id: impl Into<RunId>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_parent_run(mut self, parent_run_id: impl Into<RunId>) -> Self {
        self.parent_run_id = parent_run_id.into();
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn with_event_id(mut self, event_id: impl Into<EventId>) -> Self {
        self.event_id = event_id.into();
        self
    }

    pub fn with_agent_level(mut self, level: AgentLevel) -> Self {
        self.agent_level = level;
        self
    }

    pub fn with_correlation(
        mut self,
        correlation_id: impl Into<String>,
        causation_id: impl Into<String>,
    ) -> Self {
        self.correlation_id = correlation_id.into();
        self.causation_id = causation_id.into();
        self
    }
}

/// The canonical workflow event shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEventEnvelope {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub event: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub workflow_id: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub node_kind: String,
    #[serde(default)]
    pub is_subtask: bool,
    #[serde(default)]
    pub subtask_index: u32,
    #[serde(default)]
    pub total_subtasks: u32,
    #[serde(default)]
    pub subtask_preview: String,
    #[serde(default)]
    pub max_parallel: u32,
    #[serde(default)]
    pub payload: PayloadMap,
}

fn default_version() -> u32 {
    ENVELOPE_VERSION
}

impl WorkflowEventEnvelope {
    pub fn new(event: impl Into<String>, meta: EventMeta) -> Self {
        Self {
            meta,
            event: event.into(),
            version: ENVELOPE_VERSION,
            workflow_id: String::new(),
            node_id: String::new(),
            node_kind: String::new(),
            is_subtask: false,
            subtask_index: 0,
            total_subtasks: 0,
            subtask_preview: String::new(),
            max_parallel: 0,
            payload: PayloadMap::new(),
        }
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = workflow_id.into();
        self
    }

    pub fn with_node(mut self, node_id: impl Into<String>, node_kind: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self.node_kind = node_kind.into();
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<PayloadValue>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtaskMetadata {
    pub index: u32,
    pub total: u32,
    pub preview: String,
    pub max_parallel: u32,
}

/// An event emitted by a delegated subtask, wrapped with the parent's
/// linkage. `meta` carries the outer timestamp, session and run fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskEvent {
    pub meta: EventMeta,
    #[serde(default)]
    pub details: SubtaskMetadata,
    pub inner: Box<AgentEvent>,
}

/// A task submitted by the user, before any workflow wrapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputReceivedEvent {
    pub meta: EventMeta,
    pub task: String,
    #[serde(default)]
    pub attachments: AttachmentMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Plain lifecycle event. Retained in history, never streamed.
    Lifecycle { event_type: String, meta: EventMeta },
    Envelope(WorkflowEventEnvelope),
    Subtask(SubtaskEvent),
    InputReceived(InputReceivedEvent),
}

impl AgentEvent {
    pub fn subtask(meta: EventMeta, details: SubtaskMetadata, inner: AgentEvent) -> Self {
        Self::Subtask(SubtaskEvent {
            meta,
            details,
            inner: Box::new(inner),
        })
    }

    /// Decode an event from JSON and check it carries an event type.
    pub fn from_json(raw: &str) -> RelayResult<Self> {
        let event: Self = serde_json::from_str(raw)?;
        if event.event_type().trim().is_empty() {
            return Err(RelayError::InvalidEvent("event type is empty".to_owned()));
        }
        Ok(event)
    }

    /// The event with every subtask wrapper removed.
    pub fn base(&self) -> &AgentEvent {
        let mut current = self;
        while let Self::Subtask(wrapper) = current {
            current = &wrapper.inner;
        }
        current
    }

    /// Outer metadata of this value (the wrapper's own for subtasks).
    pub fn meta(&self) -> &EventMeta {
        match self {
            Self::Lifecycle { meta, .. } => meta,
            Self::Envelope(envelope) => &envelope.meta,
            Self::Subtask(wrapper) => &wrapper.meta,
            Self::InputReceived(input) => &input.meta,
        }
    }

    pub fn event_type(&self) -> &str {
        match self.base() {
            Self::Lifecycle { event_type, .. } => event_type,
            Self::Envelope(envelope) => &envelope.event,
            Self::InputReceived(_) => event_types::INPUT_RECEIVED,
            Self::Subtask(_) => "",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.meta().timestamp
    }

    pub fn event_id(&self) -> &EventId {
        &self.base().meta().event_id
    }

    pub fn seq(&self) -> u64 {
        self.base().meta().seq
    }

    pub fn session_id(&self) -> &SessionId {
        &self.meta().session_id
    }

    pub fn run_id(&self) -> &RunId {
        &self.meta().run_id
    }

    pub fn parent_run_id(&self) -> &RunId {
        &self.meta().parent_run_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.base().meta().correlation_id
    }

    pub fn causation_id(&self) -> &str {
        &self.base().meta().causation_id
    }

    pub fn agent_level(&self) -> AgentLevel {
        self.meta().agent_level
    }

    pub fn as_envelope(&self) -> Option<&WorkflowEventEnvelope> {
        match self.base() {
            Self::Envelope(envelope) => Some(envelope),
            _ => None,
        }
    }
}

impl From<WorkflowEventEnvelope> for AgentEvent {
    fn from(value: WorkflowEventEnvelope) -> Self {
        Self::Envelope(value)
    }
}

impl From<InputReceivedEvent> for AgentEvent {
    fn from(value: InputReceivedEvent) -> Self {
        Self::InputReceived(value)
    }
}
