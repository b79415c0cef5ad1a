use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::data_uri::{decode_data_uri, is_data_uri};
use crate::sha256_hex;

pub const DATA_PATH_PREFIX: &str = "/api/data/";

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Bytes served back for a cache id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
    pub content_type: String,
    pub bytes: Arc<[u8]>,
}

/// Result of rewriting a `data:` URI into a cache reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDescriptor {
    pub url: String,
    pub content_type: String,
    pub size: usize,
}

#[derive(Debug)]
struct StoredEntry {
    entry: CachedEntry,
    inserted_at: Instant,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, StoredEntry>,
    // Insertion order; may hold stale ids whose entry was expired or replaced.
    order: VecDeque<(String, Instant)>,
}

/// In-memory content-addressed cache for small ephemeral blobs.
///
/// At capacity the single oldest-inserted entry is evicted (reads do not
/// refresh recency). Entries older than the TTL read as absent and are
/// removed on lookup.
#[derive(Debug)]
pub struct DataCache {
    state: Mutex<CacheState>,
    capacity: usize,
    ttl: Duration,
}

impl DataCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Store `bytes` and return their URL; `None` for an empty payload.
    pub fn store_bytes(&self, media_type: &str, bytes: &[u8]) -> Option<String> {
        if bytes.is_empty() {
            return None;
        }
        let id = sha256_hex(bytes);
        let content_type = match media_type.trim() {
            "" => FALLBACK_CONTENT_TYPE.to_owned(),
            other => other.to_owned(),
        };

        let now = Instant::now();
        let mut state = self.state.lock();
        let live = state
            .entries
            .get(&id)
            .is_some_and(|stored| now.duration_since(stored.inserted_at) < self.ttl);
        if live {
            return Some(url_for(&id));
        }
        state.entries.remove(&id);

        while state.entries.len() >= self.capacity {
            let Some((oldest, inserted_at)) = state.order.pop_front() else {
                break;
            };
            let current = state
                .entries
                .get(&oldest)
                .is_some_and(|stored| stored.inserted_at == inserted_at);
            if current {
                state.entries.remove(&oldest);
                debug!(id = %oldest, "data cache evicted oldest entry");
            }
        }

        state.entries.insert(
            id.clone(),
            StoredEntry {
                entry: CachedEntry {
                    content_type,
                    bytes: Arc::from(bytes),
                },
                inserted_at: now,
            },
        );
        state.order.push_back((id.clone(), now));
        if state.order.len() > self.capacity.saturating_mul(2) {
            let CacheState { entries, order } = &mut *state;
            order.retain(|(key, at)| entries.get(key).is_some_and(|s| s.inserted_at == *at));
        }
        Some(url_for(&id))
    }

    /// Rewrite a `data:` URI into a cache reference; `None` when `value` is
    /// not a decodable, non-empty data URI.
    pub fn maybe_store_data_uri(&self, value: &str) -> Option<DataDescriptor> {
        if !is_data_uri(value) {
            return None;
        }
        let (content_type, bytes) = decode_data_uri(value)?;
        let url = self.store_bytes(&content_type, &bytes)?;
        Some(DataDescriptor {
            url,
            content_type,
            size: bytes.len(),
        })
    }

    pub fn get(&self, id: &str) -> Option<CachedEntry> {
        let mut state = self.state.lock();
        let expired = match state.entries.get(id) {
            None => return None,
            Some(stored) => stored.inserted_at.elapsed() >= self.ttl,
        };
        if expired {
            state.entries.remove(id);
            debug!(id, "data cache entry expired");
            return None;
        }
        state.entries.get(id).map(|stored| stored.entry.clone())
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DataCache {
    fn default() -> Self {
        Self::new(512, Duration::from_secs(30 * 60))
    }
}

fn url_for(id: &str) -> String {
    format!("{DATA_PATH_PREFIX}{id}")
}
