//! Recursive rendering of envelope payloads into wire JSON.

use chrono::{DateTime, SecondsFormat, Utc};
use relay_cache::{BoundedLru, is_data_uri};
use relay_protocol::{
    Attachment, AttachmentMap, NodeSnapshot, PayloadMap, PayloadValue, WorkflowSnapshot,
};
use serde_json::{Map, Value, json};

use super::Sanitizer;

pub const REDACTED: &str = "[REDACTED]";

const SENSITIVE_KEYS: &[&str] = &[
    "api_key",
    "apikey",
    "authorization",
    "password",
    "secret",
    "token",
    "access_token",
    "refresh_token",
    "client_secret",
];
const SENSITIVE_SUFFIXES: &[&str] = &["_api_key", "_token", "_secret"];

// Dropped from nested maps; they carry full histories.
const NESTED_SKIP_KEYS: &[&str] = &["nodes", "messages", "attachment_iterations"];

const ATTACHMENT_RECORD_KEYS: &[&str] = &["data", "uri", "media_type", "name"];

const STEP_SUMMARY_KEYS: &[&str] = &["summary", "content", "output", "text"];
const STEP_SUMMARY_SKIP_KEYS: &[&str] = &["messages", "attachments", "attachment_iterations"];

pub(crate) fn is_sensitive_key(key: &str) -> bool {
    let key = key.trim().to_ascii_lowercase();
    SENSITIVE_KEYS.contains(&key.as_str())
        || SENSITIVE_SUFFIXES
            .iter()
            .any(|suffix| key.ends_with(suffix))
}

pub(crate) fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Walks one payload. Attachments found anywhere are deduplicated against
/// the connection's sent set.
pub(crate) struct PayloadRenderer<'a> {
    pub(crate) sanitizer: &'a Sanitizer,
    pub(crate) sent: &'a mut BoundedLru<String, String>,
    pub(crate) force_attachments: bool,
}

impl PayloadRenderer<'_> {
    /// Top-level payload. Keys are kept even when they would be dropped
    /// from a nested map.
    pub(crate) fn render_payload(&mut self, payload: &PayloadMap) -> Map<String, Value> {
        payload
            .iter()
            .map(|(key, value)| {
                let rendered = if is_sensitive_key(key) {
                    Value::String(REDACTED.to_owned())
                } else if key == "attachments" {
                    self.render_untyped_attachments(value)
                } else {
                    self.render_value(value)
                };
                (key.clone(), rendered)
            })
            .collect()
    }

    fn render_map(&mut self, map: &PayloadMap) -> Map<String, Value> {
        let mut out = Map::with_capacity(map.len());
        for (key, value) in map {
            if NESTED_SKIP_KEYS.contains(&key.as_str()) {
                continue;
            }
            let rendered = if is_sensitive_key(key) {
                Value::String(REDACTED.to_owned())
            } else if key == "attachments" {
                self.render_untyped_attachments(value)
            } else {
                self.render_value(value)
            };
            out.insert(key.clone(), rendered);
        }
        out
    }

    pub(crate) fn render_value(&mut self, value: &PayloadValue) -> Value {
        match value {
            PayloadValue::Null | PayloadValue::Time(None) => Value::Null,
            PayloadValue::Bool(flag) => Value::Bool(*flag),
            PayloadValue::Number(number) => Value::Number(number.clone()),
            PayloadValue::String(text) => self.render_string(text),
            PayloadValue::Bytes(bytes) => self.render_string(&String::from_utf8_lossy(bytes)),
            PayloadValue::Array(items) => {
                Value::Array(items.iter().map(|item| self.render_value(item)).collect())
            }
            PayloadValue::Map(map) => Value::Object(self.render_map(map)),
            PayloadValue::Attachment(attachment) => {
                let name = if attachment.name.is_empty() {
                    "attachment".to_owned()
                } else {
                    attachment.name.clone()
                };
                let mut single = AttachmentMap::new();
                single.insert(name.clone(), attachment.as_ref().clone());
                match self.dedup(&single) {
                    Value::Object(mut rendered) => rendered.remove(&name).unwrap_or(Value::Null),
                    _ => Value::Null,
                }
            }
            PayloadValue::Attachments(attachments) => self.dedup(attachments),
            PayloadValue::Node(node) => Value::Object(render_node(node)),
            PayloadValue::Workflow(workflow) => Value::Object(render_workflow(workflow)),
            PayloadValue::Time(Some(at)) => Value::String(format_time(*at)),
        }
    }

    /// Strings holding a `data:` URI become a cache reference.
    fn render_string(&self, text: &str) -> Value {
        if let Some(cache) = &self.sanitizer.data_cache
            && is_data_uri(text)
            && let Some(descriptor) = cache.maybe_store_data_uri(text)
        {
            return json!({
                "url": descriptor.url,
                "content_type": descriptor.content_type,
                "size": descriptor.size,
            });
        }
        Value::String(text.to_owned())
    }

    fn render_untyped_attachments(&mut self, value: &PayloadValue) -> Value {
        let raw = match value {
            PayloadValue::Attachments(attachments) => return self.dedup(attachments),
            PayloadValue::Map(raw) => raw,
            other => return self.render_value(other),
        };

        let attachments: AttachmentMap = raw
            .iter()
            .filter_map(|(name, entry)| {
                let record = entry.as_map().filter(|map| is_attachment_record(map))?;
                Some((name.clone(), attachment_from_record(name, record)))
            })
            .collect();
        // No records: the map is rendered like a top-level payload.
        if attachments.is_empty() {
            return Value::Object(self.render_payload(raw));
        }
        self.dedup(&attachments)
    }

    fn dedup(&mut self, attachments: &AttachmentMap) -> Value {
        let sanitized =
            self.sanitizer
                .sanitize_attachments(attachments, self.sent, self.force_attachments);
        if sanitized.is_empty() {
            return Value::Null;
        }
        serde_json::to_value(sanitized).unwrap_or(Value::Null)
    }
}

fn is_attachment_record(map: &PayloadMap) -> bool {
    ATTACHMENT_RECORD_KEYS
        .iter()
        .any(|key| map.contains_key(*key))
}

fn attachment_from_record(name: &str, record: &PayloadMap) -> Attachment {
    let field = |key: &str| {
        record
            .get(key)
            .and_then(PayloadValue::as_str)
            .unwrap_or_default()
            .to_owned()
    };
    let mut attachment = Attachment {
        name: field("name"),
        media_type: field("media_type"),
        data: field("data"),
        uri: field("uri"),
        source: field("source"),
        description: field("description"),
        kind: field("kind"),
        format: field("format"),
        preview_profile: field("preview_profile"),
        preview_assets: Vec::new(),
    };
    if attachment.name.is_empty() {
        attachment.name = name.to_owned();
    }
    attachment
}

fn render_node(node: &NodeSnapshot) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("id".into(), node.id.clone().into());
    out.insert("status".into(), node.status.clone().into());
    if !node.error.is_empty() {
        out.insert("error".into(), node.error.clone().into());
    }
    insert_timing(
        &mut out,
        node.started_at,
        node.completed_at,
        node.duration_ms,
    );
    out
}

fn render_workflow(workflow: &WorkflowSnapshot) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("id".into(), workflow.id.clone().into());
    out.insert("phase".into(), workflow.phase.clone().into());
    out.insert("order".into(), json!(workflow.order));
    out.insert("summary".into(), json!(workflow.summary));
    insert_timing(
        &mut out,
        workflow.started_at,
        workflow.completed_at,
        workflow.duration_ms,
    );
    out
}

fn insert_timing(
    out: &mut Map<String, Value>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: u64,
) {
    if let Some(at) = started_at {
        out.insert("started_at".into(), format_time(at).into());
    }
    if let Some(at) = completed_at {
        out.insert("completed_at".into(), format_time(at).into());
    }
    if duration_ms > 0 {
        out.insert("duration".into(), duration_ms.into());
    }
}

/// Strip histories from a completed step's payload and derive `step_result`.
pub(crate) fn scrub_step_payload(payload: &PayloadMap) -> PayloadMap {
    let mut scrubbed = payload.clone();
    if let Some(result) = scrubbed.get("result") {
        let clean = clean_step_result(result);
        let summary = summarize_step_result(&clean);
        scrubbed.insert("result".to_owned(), clean);
        if !summary.is_empty() {
            scrubbed.insert("step_result".to_owned(), PayloadValue::String(summary));
        }
    } else if let Some(step_result) = scrubbed.get("step_result") {
        let summary = summarize_step_result(step_result);
        if !summary.is_empty() {
            scrubbed.insert("step_result".to_owned(), PayloadValue::String(summary));
        }
    }
    scrubbed
}

fn clean_step_result(value: &PayloadValue) -> PayloadValue {
    match value {
        PayloadValue::Map(map) => PayloadValue::Map(
            map.iter()
                .filter(|(key, _)| !matches!(key.as_str(), "messages" | "attachment_iterations"))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        PayloadValue::Array(_) => PayloadValue::Null,
        other => other.clone(),
    }
}

/// Short human-readable summary of a step result.
pub(crate) fn summarize_step_result(value: &PayloadValue) -> String {
    let map = match value {
        PayloadValue::Null => return String::new(),
        PayloadValue::Map(map) => map,
        other => return other.to_string(),
    };

    let text = |key: &str| {
        map.get(key)
            .and_then(PayloadValue::as_str)
            .filter(|text| !text.is_empty())
    };
    if let Some(error) = text("error") {
        return error.to_owned();
    }
    if let Some(found) = STEP_SUMMARY_KEYS.iter().find_map(|key| text(key)) {
        return found.to_owned();
    }

    let clean: PayloadMap = map
        .iter()
        .filter(|(key, _)| !STEP_SUMMARY_SKIP_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    if clean.is_empty() {
        return String::new();
    }
    if let Some(description) = text("description") {
        return description.to_owned();
    }
    PayloadValue::Map(clean).to_string()
}
