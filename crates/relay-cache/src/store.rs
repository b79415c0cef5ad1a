use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tempfile::NamedTempFile;
use tracing::{debug, instrument};

use crate::error::{CacheError, CacheResult};
use crate::sha256_hex;

pub const ATTACHMENT_PATH_PREFIX: &str = "/api/attachments/";

static ATTACHMENT_FILENAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-f0-9]{64}(\.[a-z0-9]{1,10})?$").expect("valid attachment filename regex")
});

// (media type, extension) pairs; first match wins in both directions.
const MIME_EXTENSIONS: &[(&str, &str)] = &[
    ("text/html", "html"),
    ("text/plain", "txt"),
    ("text/markdown", "md"),
    ("text/csv", "csv"),
    ("application/json", "json"),
    ("application/pdf", "pdf"),
    ("application/zip", "zip"),
    ("image/png", "png"),
    ("image/jpeg", "jpg"),
    ("image/gif", "gif"),
    ("image/webp", "webp"),
    ("image/svg+xml", "svg"),
];

/// Content-addressed attachment files on local disk.
///
/// Files are named `<sha256><ext>`; storing identical bytes twice returns the
/// same reference without rewriting the file.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    dir: PathBuf,
}

impl AttachmentStore {
    /// Open (creating if needed) the store directory. A leading `~/` expands
    /// to `$HOME`.
    pub fn open(dir: impl AsRef<Path>) -> CacheResult<Self> {
        let dir = expand_home(dir.as_ref());
        fs::create_dir_all(&dir).map_err(|source| CacheError::io(dir.display(), source))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist `bytes` and return the URL they are served from.
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub fn store_bytes(&self, name: &str, media_type: &str, bytes: &[u8]) -> CacheResult<String> {
        if bytes.is_empty() {
            return Err(CacheError::EmptyPayload);
        }
        let filename = build_filename(name, media_type, bytes);
        let target = self.dir.join(&filename);
        if target.exists() {
            return Ok(uri_for(&filename));
        }

        let mut tmp: NamedTempFile = tempfile::Builder::new()
            .prefix(&format!("{filename}.tmp-"))
            .tempfile_in(&self.dir)
            .map_err(|source| CacheError::io(self.dir.display(), source))?;
        tmp.write_all(bytes)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|source| CacheError::io(tmp.path().display(), source))?;

        match tmp.persist_noclobber(&target) {
            Ok(_) => {
                debug!(%filename, "attachment stored");
                Ok(uri_for(&filename))
            }
            // A concurrent writer with the same content won the race.
            Err(_) if target.exists() => Ok(uri_for(&filename)),
            Err(err) => Err(CacheError::io(target.display(), err.error)),
        }
    }

    /// Map a served filename to its path on disk.
    pub fn resolve(&self, filename: &str) -> CacheResult<PathBuf> {
        let candidate = filename.trim().trim_start_matches('/');
        if !ATTACHMENT_FILENAME.is_match(candidate) {
            return Err(CacheError::InvalidFilename(filename.to_owned()));
        }
        let path = self.dir.join(candidate);
        if !path.is_file() {
            return Err(CacheError::NotFound(candidate.to_owned()));
        }
        Ok(path)
    }
}

/// Media type for a stored filename, from its extension.
pub fn content_type_for_filename(filename: &str) -> &'static str {
    let ext = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    MIME_EXTENSIONS
        .iter()
        .find(|(_, known)| known.eq_ignore_ascii_case(ext))
        .map(|(media, _)| *media)
        .unwrap_or("application/octet-stream")
}

fn uri_for(filename: &str) -> String {
    format!("{ATTACHMENT_PATH_PREFIX}{filename}")
}

fn build_filename(name: &str, media_type: &str, bytes: &[u8]) -> String {
    let ext = Path::new(name.trim())
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(sanitize_extension)
        .or_else(|| extension_for_media_type(media_type));
    match ext {
        Some(ext) => format!("{}.{ext}", sha256_hex(bytes)),
        None => sha256_hex(bytes),
    }
}

fn sanitize_extension(raw: &str) -> Option<String> {
    let ext = raw.trim().trim_start_matches('.').to_ascii_lowercase();
    let valid = !ext.is_empty()
        && ext.len() <= 10
        && ext.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    valid.then_some(ext)
}

fn extension_for_media_type(media_type: &str) -> Option<String> {
    let bare = media_type.split(';').next()?.trim().to_ascii_lowercase();
    MIME_EXTENSIONS
        .iter()
        .find(|(media, _)| *media == bare)
        .map(|(_, ext)| (*ext).to_owned())
}

fn expand_home(dir: &Path) -> PathBuf {
    if let Ok(rest) = dir.strip_prefix("~")
        && let Some(home) = std::env::var_os("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    dir.to_path_buf()
}
