//! Closed dynamic value carried in envelope payloads.
//!
//! Plain JSON maps onto the `Null`..`Map` variants. The remaining variants
//! are typed values a producer can embed directly; the stream sanitizer
//! renders each of them into its wire form.

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Number;

use crate::attachment::{Attachment, AttachmentMap};

pub type PayloadMap = IndexMap<String, PayloadValue>;

#[derive(Debug, Clone, Default, PartialEq)]
pub enum PayloadValue {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<PayloadValue>),
    Map(PayloadMap),
    Attachment(Box<Attachment>),
    Attachments(AttachmentMap),
    Node(NodeSnapshot),
    Workflow(WorkflowSnapshot),
    Time(Option<DateTime<Utc>>),
}

impl PayloadValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&PayloadMap> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Lossy conversion to plain JSON, typed variants included.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Compact single-line JSON, used for human-readable fallbacks.
impl fmt::Display for PayloadValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(value) => f.write_str(value),
            Self::Bytes(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl Serialize for PayloadValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null | Self::Time(None) => serializer.serialize_unit(),
            Self::Bool(value) => serializer.serialize_bool(*value),
            Self::Number(value) => value.serialize(serializer),
            Self::String(value) => serializer.serialize_str(value),
            Self::Bytes(bytes) => serializer.serialize_str(&String::from_utf8_lossy(bytes)),
            Self::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Map(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    out.serialize_entry(key, value)?;
                }
                out.end()
            }
            Self::Attachment(attachment) => attachment.serialize(serializer),
            Self::Attachments(attachments) => attachments.serialize(serializer),
            Self::Node(node) => node.serialize(serializer),
            Self::Workflow(workflow) => workflow.serialize(serializer),
            Self::Time(Some(at)) => at.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for PayloadValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Self::from)
    }
}

impl From<serde_json::Value> for PayloadValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Self::Null,
            Value::Bool(value) => Self::Bool(value),
            Value::Number(value) => Self::Number(value),
            Value::String(value) => Self::String(value),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(key, value)| (key, Self::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for PayloadValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for PayloadValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for PayloadValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<u64> for PayloadValue {
    fn from(value: u64) -> Self {
        Self::Number(value.into())
    }
}

impl From<i64> for PayloadValue {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl From<Attachment> for PayloadValue {
    fn from(value: Attachment) -> Self {
        Self::Attachment(Box::new(value))
    }
}

impl From<AttachmentMap> for PayloadValue {
    fn from(value: AttachmentMap) -> Self {
        Self::Attachments(value)
    }
}

impl From<NodeSnapshot> for PayloadValue {
    fn from(value: NodeSnapshot) -> Self {
        Self::Node(value)
    }
}

impl From<WorkflowSnapshot> for PayloadValue {
    fn from(value: WorkflowSnapshot) -> Self {
        Self::Workflow(value)
    }
}

impl From<DateTime<Utc>> for PayloadValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Time(Some(value))
    }
}

impl From<PayloadMap> for PayloadValue {
    fn from(value: PayloadMap) -> Self {
        Self::Map(value)
    }
}

/// Execution state of one workflow node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSnapshot {
    pub id: String,
    pub status: String,
    pub error: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

/// Aggregate state of a workflow, including every node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSnapshot {
    pub id: String,
    pub phase: String,
    pub order: Vec<String>,
    pub summary: IndexMap<String, u64>,
    pub nodes: Vec<NodeSnapshot>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_json_maps_onto_dynamic_variants() {
        let value = PayloadValue::from(json!({
            "tool_name": "shell",
            "ok": true,
            "count": 3,
            "items": [null, "x"],
        }));
        let map = value.as_map().expect("map");
        assert_eq!(map["tool_name"].as_str(), Some("shell"));
        assert_eq!(map["ok"].as_bool(), Some(true));
        assert!(matches!(&map["items"], PayloadValue::Array(items) if items[0].is_null()));
    }

    #[test]
    fn serializes_back_to_plain_json() {
        let source = json!({ "a": [1, "two", { "b": false }], "c": null });
        let value: PayloadValue = serde_json::from_value(source.clone()).unwrap();
        assert_eq!(serde_json::to_value(&value).unwrap(), source);
    }

    #[test]
    fn display_is_compact() {
        let value = PayloadValue::from(json!({ "k": 1 }));
        assert_eq!(value.to_string(), "{\"k\":1}");
        assert_eq!(PayloadValue::from("plain").to_string(), "plain");
        assert_eq!(PayloadValue::Bytes(b"raw".to_vec()).to_string(), "raw");
    }
}
