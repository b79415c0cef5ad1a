use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Named attachments, in producer order.
pub type AttachmentMap = IndexMap<String, Attachment>;

/// A file-like artifact carried by an event.
///
/// `data` is base64. `uri` is an external URL, a cache/store reference, or a
/// raw `data:` URI before sanitization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Attachment {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub data: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uri: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub format: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub preview_profile: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub preview_assets: Vec<PreviewAsset>,
}

impl Attachment {
    pub fn new(name: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            media_type: media_type.into(),
            ..Self::default()
        }
    }

    pub fn with_data(mut self, base64_data: impl Into<String>) -> Self {
        self.data = base64_data.into();
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    /// True when `uri` holds an inline `data:` URI.
    pub fn has_data_uri(&self) -> bool {
        self.uri
            .trim_start()
            .get(..5)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("data:"))
    }

    /// True when `uri` points at something other than an inline payload.
    pub fn has_external_uri(&self) -> bool {
        !self.uri.trim().is_empty() && !self.has_data_uri()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewAsset {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub asset_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub label: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mime_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cdn_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub preview_type: String,
}
