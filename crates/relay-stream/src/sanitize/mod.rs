//! Wire rendering of agent events.
//!
//! [`Sanitizer`] is shared by every connection and holds the payload
//! caches. Everything that depends on what a particular client has
//! already received lives in [`ConnectionCaches`], one per connection.

mod attachments;
mod payload;

use std::sync::Arc;

use relay_cache::{AttachmentStore, BoundedLru, DataCache};
use relay_protocol::event_types::RESULT_FINAL;
use relay_protocol::{
    AgentEvent, InputReceivedEvent, PayloadValue, SubtaskEvent, WorkflowEventEnvelope,
    event_types,
};
use serde_json::{Map, Value};

pub use attachments::INLINE_RETENTION_LIMIT;
pub use payload::REDACTED;

use payload::{PayloadRenderer, format_time, scrub_step_payload};

/// Per-connection memory of delivered attachments and final answers.
#[derive(Debug)]
pub struct ConnectionCaches {
    /// Attachment name to digest of the version last sent.
    pub sent_attachments: BoundedLru<String, String>,
    /// Run id to the last full final answer seen while streaming.
    pub final_answers: BoundedLru<String, String>,
}

impl ConnectionCaches {
    pub fn new(sent_attachment_capacity: usize, final_answer_capacity: usize) -> Self {
        Self {
            sent_attachments: BoundedLru::new(sent_attachment_capacity),
            final_answers: BoundedLru::new(final_answer_capacity),
        }
    }
}

/// Converts events into wire JSON objects.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    pub(crate) data_cache: Option<Arc<DataCache>>,
    pub(crate) store: Option<Arc<AttachmentStore>>,
    stream_deltas: bool,
}

impl Sanitizer {
    pub fn new(data_cache: Option<Arc<DataCache>>, store: Option<Arc<AttachmentStore>>) -> Self {
        Self {
            data_cache,
            store,
            stream_deltas: true,
        }
    }

    /// Disable final-answer deltas; every frame then carries the full answer.
    pub fn with_stream_deltas(mut self, enabled: bool) -> Self {
        self.stream_deltas = enabled;
        self
    }

    /// Serialize `event` to a single-line JSON string.
    pub fn serialize(
        &self,
        event: &AgentEvent,
        caches: &mut ConnectionCaches,
    ) -> serde_json::Result<String> {
        serde_json::to_string(&Value::Object(self.render(event, caches)))
    }

    /// Build the wire object for `event`.
    pub fn render(&self, event: &AgentEvent, caches: &mut ConnectionCaches) -> Map<String, Value> {
        let (input, envelope) = match event {
            AgentEvent::Subtask(wrapper) => return self.render_subtask(wrapper, caches),
            AgentEvent::Lifecycle { .. } => (None, None),
            AgentEvent::InputReceived(input) => (Some(input), None),
            AgentEvent::Envelope(envelope) => (None, Some(envelope)),
        };

        let mut data = base_fields(event);
        if let Some(input) = input {
            self.render_input(input, caches, &mut data);
        }
        if let Some(envelope) = envelope {
            self.render_envelope(envelope, caches, &mut data);
        }
        data
    }

    fn render_subtask(
        &self,
        wrapper: &SubtaskEvent,
        caches: &mut ConnectionCaches,
    ) -> Map<String, Value> {
        let mut data = self.render(&wrapper.inner, caches);
        let meta = &wrapper.meta;
        data.insert("timestamp".into(), format_time(meta.timestamp).into());
        data.insert("agent_level".into(), meta.agent_level.as_str().into());
        data.insert("session_id".into(), meta.session_id.as_str().into());
        data.insert("run_id".into(), meta.run_id.as_str().into());
        if !meta.parent_run_id.is_empty() {
            data.insert("parent_run_id".into(), meta.parent_run_id.as_str().into());
        }
        data.insert("is_subtask".into(), true.into());

        let details = &wrapper.details;
        if details.index > 0 {
            data.insert("subtask_index".into(), details.index.into());
        }
        if details.total > 0 {
            data.insert("total_subtasks".into(), details.total.into());
        }
        if !details.preview.is_empty() {
            data.insert("subtask_preview".into(), details.preview.clone().into());
        }
        if details.max_parallel > 0 {
            data.insert("max_parallel".into(), details.max_parallel.into());
        }
        data
    }

    // Input is delivered once, so its attachments always go out in full.
    fn render_input(
        &self,
        input: &InputReceivedEvent,
        caches: &mut ConnectionCaches,
        data: &mut Map<String, Value>,
    ) {
        if !input.attachments.is_empty() {
            let sanitized =
                self.sanitize_attachments(&input.attachments, &mut caches.sent_attachments, true);
            if !sanitized.is_empty()
                && let Ok(value) = serde_json::to_value(sanitized)
            {
                data.insert("attachments".into(), value);
            }
        }
        data.insert("task".into(), input.task.clone().into());
    }

    fn render_envelope(
        &self,
        envelope: &WorkflowEventEnvelope,
        caches: &mut ConnectionCaches,
        data: &mut Map<String, Value>,
    ) {
        data.insert("version".into(), envelope.version.into());
        for (key, value) in [
            ("workflow_id", &envelope.workflow_id),
            ("node_id", &envelope.node_id),
            ("node_kind", &envelope.node_kind),
        ] {
            if !value.is_empty() {
                data.insert(key.into(), value.clone().into());
            }
        }
        if envelope.is_subtask {
            data.insert("is_subtask".into(), true.into());
        }
        if envelope.subtask_index > 0 {
            data.insert("subtask_index".into(), envelope.subtask_index.into());
        }
        if envelope.total_subtasks > 0 {
            data.insert("total_subtasks".into(), envelope.total_subtasks.into());
        }
        if !envelope.subtask_preview.is_empty() {
            data.insert(
                "subtask_preview".into(),
                envelope.subtask_preview.clone().into(),
            );
        }
        if envelope.max_parallel > 0 {
            data.insert("max_parallel".into(), envelope.max_parallel.into());
        }

        let scrubbed;
        let source = if envelope.event == event_types::NODE_COMPLETED && envelope.node_kind == "step"
        {
            scrubbed = scrub_step_payload(&envelope.payload);
            &scrubbed
        } else {
            &envelope.payload
        };

        let mut renderer = PayloadRenderer {
            sanitizer: self,
            sent: &mut caches.sent_attachments,
            force_attachments: is_terminal_final(envelope),
        };
        let mut payload = renderer.render_payload(source);

        if self.stream_deltas && envelope.event == RESULT_FINAL {
            apply_final_answer_delta(envelope, &mut payload, &mut caches.final_answers);
        }
        if !payload.is_empty() {
            data.insert("payload".into(), Value::Object(payload));
        }
    }
}

fn base_fields(event: &AgentEvent) -> Map<String, Value> {
    let meta = event.meta();
    let mut data = Map::new();
    data.insert("event_id".into(), meta.event_id.as_str().into());
    data.insert("event_type".into(), event.event_type().into());
    data.insert("seq".into(), meta.seq.into());
    data.insert("timestamp".into(), format_time(meta.timestamp).into());
    data.insert("agent_level".into(), meta.agent_level.as_str().into());
    data.insert("session_id".into(), meta.session_id.as_str().into());
    data.insert("run_id".into(), meta.run_id.as_str().into());
    data.insert("parent_run_id".into(), meta.parent_run_id.as_str().into());
    data.insert("correlation_id".into(), meta.correlation_id.clone().into());
    data.insert("causation_id".into(), meta.causation_id.clone().into());
    data
}

fn payload_flag(envelope: &WorkflowEventEnvelope, key: &str) -> bool {
    envelope
        .payload
        .get(key)
        .and_then(PayloadValue::as_bool)
        .unwrap_or(false)
}

fn is_terminal_final(envelope: &WorkflowEventEnvelope) -> bool {
    envelope.event == RESULT_FINAL && payload_flag(envelope, "stream_finished")
}

/// Replace a growing `final_answer` with the part not yet sent for the run.
fn apply_final_answer_delta(
    envelope: &WorkflowEventEnvelope,
    payload: &mut Map<String, Value>,
    cache: &mut BoundedLru<String, String>,
) {
    let Some(Value::String(answer)) = payload.get("final_answer") else {
        return;
    };
    let answer = answer.clone();
    let key = envelope.meta.run_id.as_str().to_owned();

    let delta = match cache.get(&key) {
        Some(previous) if answer.starts_with(previous.as_str()) => {
            answer[previous.len()..].to_owned()
        }
        _ => answer.clone(),
    };
    if !key.is_empty() {
        if payload_flag(envelope, "is_streaming") {
            cache.put(key.clone(), answer);
        }
        if payload_flag(envelope, "stream_finished") {
            cache.remove(&key);
        }
    }
    payload.insert("final_answer".into(), Value::String(delta));
}
