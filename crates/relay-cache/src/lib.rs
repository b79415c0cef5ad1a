//! Bounded stores that turn inline payloads into stable references.
//!
//! - [`DataCache`] keeps small blobs in memory, served from `/api/data/<id>`.
//! - [`AttachmentStore`] writes content-addressed files served from
//!   `/api/attachments/<filename>`.
//! - [`BoundedLru`] backs the per-connection dedup state.

mod bounded;
mod data_cache;
mod data_uri;
mod error;
mod store;

use sha2::{Digest, Sha256};

pub use bounded::BoundedLru;
pub use data_cache::{CachedEntry, DATA_PATH_PREFIX, DataCache, DataDescriptor};
pub use data_uri::{decode_data_uri, is_data_uri};
pub use error::{CacheError, CacheResult};
pub use store::{ATTACHMENT_PATH_PREFIX, AttachmentStore, content_type_for_filename};

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(digest)
}
