//! Attachment normalization and per-connection attachment dedup.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use relay_cache::{BoundedLru, decode_data_uri};
use relay_protocol::{Attachment, AttachmentMap, PreviewAsset};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::Sanitizer;

/// Inline payloads up to this size survive next to their stored URI.
pub const INLINE_RETENTION_LIMIT: usize = 128 * 1024;

const FALLBACK_MEDIA_TYPE: &str = "application/octet-stream";

impl Sanitizer {
    /// Normalize every attachment, then keep only those this connection has
    /// not already received in identical form. `force` returns all of them.
    pub(crate) fn sanitize_attachments(
        &self,
        attachments: &AttachmentMap,
        sent: &mut BoundedLru<String, String>,
        force: bool,
    ) -> AttachmentMap {
        let normalized: AttachmentMap = attachments
            .iter()
            .map(|(name, attachment)| (name.clone(), self.normalize_attachment(attachment)))
            .collect();

        if force || sent.is_empty() {
            for (name, attachment) in &normalized {
                sent.put(name.clone(), attachment_digest(attachment));
            }
            return normalized;
        }

        normalized
            .into_iter()
            .filter(|(name, attachment)| {
                let digest = attachment_digest(attachment);
                if sent.get(name).is_some_and(|previous| *previous == digest) {
                    return false;
                }
                sent.put(name.clone(), digest);
                true
            })
            .collect()
    }

    /// Rewrite inline payloads into store or cache references.
    pub fn normalize_attachment(&self, attachment: &Attachment) -> Attachment {
        let mut att = attachment.clone();

        if let Some(store) = &self.store {
            if should_persist_html(&att) {
                if let Some(persisted) = self.persist_to_store(&att, store, true) {
                    return persisted;
                }
            } else if has_inline_payload(&att)
                && let Some(persisted) = self.persist_to_store(&att, store, false)
            {
                return persisted;
            }
        }

        let Some(cache) = &self.data_cache else {
            return ensure_html_preview(att);
        };

        if att.data.is_empty() && att.has_external_uri() {
            return ensure_html_preview(att);
        }

        let media_type = match att.media_type.trim() {
            "" => FALLBACK_MEDIA_TYPE.to_owned(),
            media => media.to_owned(),
        };

        if !att.data.is_empty()
            && let Ok(decoded) = STANDARD.decode(att.data.trim())
            && let Some(url) = cache.store_bytes(&media_type, &decoded)
        {
            att.uri = url;
            if att.media_type.is_empty() {
                att.media_type = media_type;
            }
            att.data = retained_inline(&att.media_type, &decoded).unwrap_or_default();
            return ensure_html_preview(att);
        }

        if att.has_data_uri()
            && let Some((content_type, decoded)) = decode_data_uri(&att.uri)
            && let Some(url) = cache.store_bytes(&content_type, &decoded)
        {
            att.uri = url;
            att.media_type = content_type;
            att.data = retained_inline(&att.media_type, &decoded).unwrap_or_default();
        }
        ensure_html_preview(att)
    }

    fn persist_to_store(
        &self,
        att: &Attachment,
        store: &relay_cache::AttachmentStore,
        html: bool,
    ) -> Option<Attachment> {
        let (mut media_type, payload) = inline_payload(att)?;
        if html && media_type == FALLBACK_MEDIA_TYPE {
            media_type = "text/html".to_owned();
        }
        let uri = match store.store_bytes(&att.name, &media_type, &payload) {
            Ok(uri) => uri,
            Err(error) => {
                warn!(name = %att.name, %error, "failed to persist attachment");
                return None;
            }
        };
        debug!(name = %att.name, %uri, "attachment persisted");

        let mut persisted = att.clone();
        persisted.uri = uri;
        if persisted.media_type.is_empty() {
            persisted.media_type = media_type;
        }
        persisted.data = if html {
            String::new()
        } else {
            retained_inline(&persisted.media_type, &payload).unwrap_or_default()
        };
        Some(ensure_html_preview(persisted))
    }
}

/// SHA-256 hex of the attachment's JSON form.
pub(crate) fn attachment_digest(att: &Attachment) -> String {
    match serde_json::to_vec(att) {
        Ok(encoded) => hex::encode(Sha256::digest(&encoded)),
        Err(_) => att.name.clone(),
    }
}

pub(crate) fn is_html_attachment(att: &Attachment) -> bool {
    let media = att.media_type.trim().to_ascii_lowercase();
    let format = att.format.trim().to_ascii_lowercase();
    let profile = att.preview_profile.trim().to_ascii_lowercase();
    media.contains("html") || format == "html" || profile.contains("document.html")
}

fn should_persist_html(att: &Attachment) -> bool {
    is_html_attachment(att) && !(att.has_external_uri() && att.data.trim().is_empty())
}

fn has_inline_payload(att: &Attachment) -> bool {
    !att.data.trim().is_empty() || att.has_data_uri()
}

/// Decoded inline bytes with their media type; base64 `data` wins over a
/// `data:` URI.
fn inline_payload(att: &Attachment) -> Option<(String, Vec<u8>)> {
    let declared = att.media_type.trim();
    let payload = if !att.data.trim().is_empty() {
        let decoded = STANDARD.decode(att.data.trim()).ok()?;
        let media = if declared.is_empty() {
            FALLBACK_MEDIA_TYPE
        } else {
            declared
        };
        (media.to_owned(), decoded)
    } else if att.has_data_uri() {
        decode_data_uri(&att.uri)?
    } else {
        return None;
    };
    (!payload.1.is_empty()).then_some(payload)
}

/// Base64 copy of `payload` when it is small and text-like.
fn retained_inline(media_type: &str, payload: &[u8]) -> Option<String> {
    if payload.is_empty() || payload.len() > INLINE_RETENTION_LIMIT {
        return None;
    }
    let media = media_type.trim().to_ascii_lowercase();
    let text_like =
        media.starts_with("text/") || media.contains("markdown") || media.contains("json");
    text_like.then(|| STANDARD.encode(payload))
}

pub(crate) fn ensure_html_preview(mut att: Attachment) -> Attachment {
    if !is_html_attachment(&att) {
        return att;
    }
    if att.media_type.is_empty() {
        att.media_type = "text/html".to_owned();
    }
    if att.format.is_empty() {
        att.format = "html".to_owned();
    }
    if att.preview_profile.is_empty() {
        att.preview_profile = "document.html".to_owned();
    }

    let has_html_preview = att
        .preview_assets
        .iter()
        .any(|asset| asset.mime_type.to_ascii_lowercase().contains("html"));
    if !has_html_preview && !att.uri.trim().is_empty() {
        att.preview_assets.push(PreviewAsset {
            asset_id: format!("{}-html", att.name.trim()),
            label: "HTML preview".to_owned(),
            mime_type: att.media_type.clone(),
            cdn_url: att.uri.clone(),
            preview_type: "iframe".to_owned(),
        });
    }
    att
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use relay_cache::{AttachmentStore, DataCache};
    use std::sync::Arc;

    fn b64(raw: &[u8]) -> String {
        STANDARD.encode(raw)
    }

    fn cache_only() -> Sanitizer {
        Sanitizer::new(Some(Arc::new(DataCache::default())), None)
    }

    #[test]
    fn html_is_persisted_with_preview() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(AttachmentStore::open(dir.path())?);
        let sanitizer = Sanitizer::new(Some(Arc::new(DataCache::default())), Some(store));

        let att = Attachment::new("page", "text/html").with_data(b64(b"<h1>hi</h1>"));
        let out = sanitizer.normalize_attachment(&att);

        assert!(out.uri.starts_with("/api/attachments/"));
        assert!(out.uri.ends_with(".html"));
        assert!(out.data.is_empty());
        assert_eq!(out.format, "html");
        assert_eq!(out.preview_profile, "document.html");
        assert_eq!(out.preview_assets.len(), 1);
        assert_eq!(out.preview_assets[0].asset_id, "page-html");
        assert_eq!(out.preview_assets[0].cdn_url, out.uri);
        assert_eq!(out.preview_assets[0].preview_type, "iframe");
        Ok(())
    }

    #[test]
    fn store_retains_small_text_inline_only() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(AttachmentStore::open(dir.path())?);
        let sanitizer = Sanitizer::new(None, Some(store));

        let notes = Attachment::new("notes.md", "text/markdown").with_data(b64(b"# notes"));
        let out = sanitizer.normalize_attachment(&notes);
        assert!(out.uri.ends_with(".md"));
        assert_eq!(out.data, b64(b"# notes"));

        let image = Attachment::new("shot.png", "")
            .with_uri(format!("data:image/png;base64,{}", b64(&[137, 80, 78, 71])));
        let out = sanitizer.normalize_attachment(&image);
        assert!(out.uri.ends_with(".png"));
        assert!(out.data.is_empty());
        assert_eq!(out.media_type, "image/png");

        let big = vec![b'a'; INLINE_RETENTION_LIMIT + 1];
        let large = Attachment::new("big.txt", "text/plain").with_data(b64(&big));
        assert!(sanitizer.normalize_attachment(&large).data.is_empty());
        Ok(())
    }

    #[test]
    fn cache_fallback_rewrites_data_uri() {
        let sanitizer = cache_only();
        let att = Attachment::new("hello.txt", "").with_uri("data:text/plain;base64,aGVsbG8=");
        let out = sanitizer.normalize_attachment(&att);

        assert!(out.uri.starts_with("/api/data/"));
        assert_eq!(out.media_type, "text/plain");
        assert_eq!(out.data, "aGVsbG8=");
        assert!(!out.has_data_uri());
    }

    #[test]
    fn cache_fallback_drops_large_binary_inline() {
        let sanitizer = cache_only();
        let att = Attachment::new("blob.bin", "application/zip").with_data(b64(b"PK\x03\x04"));
        let out = sanitizer.normalize_attachment(&att);
        assert!(out.uri.starts_with("/api/data/"));
        assert!(out.data.is_empty());
    }

    #[test]
    fn external_uri_passes_through() {
        let sanitizer = cache_only();
        let att = Attachment::new("logo.png", "image/png").with_uri("https://cdn.example/logo.png");
        assert_eq!(sanitizer.normalize_attachment(&att), att);
    }

    #[test]
    fn dedup_skips_unchanged_attachments() {
        let sanitizer = cache_only();
        let mut sent = BoundedLru::new(8);
        let mut attachments = AttachmentMap::new();
        attachments.insert(
            "a.txt".to_owned(),
            Attachment::new("a.txt", "text/plain").with_uri("https://x/a.txt"),
        );

        assert_eq!(sanitizer.sanitize_attachments(&attachments, &mut sent, false).len(), 1);
        assert!(sanitizer.sanitize_attachments(&attachments, &mut sent, false).is_empty());
        assert_eq!(sanitizer.sanitize_attachments(&attachments, &mut sent, true).len(), 1);

        attachments.insert(
            "a.txt".to_owned(),
            Attachment::new("a.txt", "text/plain").with_uri("https://x/a-v2.txt"),
        );
        assert_eq!(sanitizer.sanitize_attachments(&attachments, &mut sent, false).len(), 1);
    }
}
