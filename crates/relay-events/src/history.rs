use std::collections::{HashMap, VecDeque};

use relay_protocol::SessionId;
use tracing::debug;

use crate::StreamItem;

/// Which buffer a history query reads. An empty session id selects the
/// global buffer (events published without a session).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryFilter {
    pub session_id: SessionId,
}

impl HistoryFilter {
    pub fn global() -> Self {
        Self::default()
    }

    pub fn session(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }

    pub fn is_global(&self) -> bool {
        self.session_id.is_empty()
    }
}

/// Per-session and global ring buffers, each capped at `limit` items.
///
/// At most `max_sessions` session buffers are kept. Making room evicts the
/// buffer of the session with the oldest last event among sessions without
/// subscribers; when every session is subscribed the cap is exceeded.
#[derive(Debug)]
pub(crate) struct HistoryBuffer {
    limit: usize,
    max_sessions: usize,
    global: VecDeque<StreamItem>,
    sessions: HashMap<SessionId, VecDeque<StreamItem>>,
}

impl HistoryBuffer {
    pub(crate) fn new(limit: usize, max_sessions: usize) -> Self {
        Self {
            limit,
            max_sessions: max_sessions.max(1),
            global: VecDeque::new(),
            sessions: HashMap::new(),
        }
    }

    pub(crate) fn record(
        &mut self,
        session_id: &SessionId,
        item: &StreamItem,
        is_subscribed: impl Fn(&SessionId) -> bool,
    ) {
        if self.limit == 0 {
            return;
        }
        if !session_id.is_empty()
            && !self.sessions.contains_key(session_id)
            && self.sessions.len() >= self.max_sessions
        {
            self.evict_idle(is_subscribed);
        }
        let buffer = if session_id.is_empty() {
            &mut self.global
        } else {
            self.sessions.entry(session_id.clone()).or_default()
        };
        if buffer.len() >= self.limit {
            buffer.pop_front();
        }
        buffer.push_back(item.clone());
    }

    fn evict_idle(&mut self, is_subscribed: impl Fn(&SessionId) -> bool) {
        let oldest = self
            .sessions
            .iter()
            .filter(|(session_id, _)| !is_subscribed(session_id))
            .filter_map(|(session_id, items)| items.back().map(|last| (last.offset, session_id)))
            .min_by_key(|(offset, _)| *offset)
            .map(|(_, session_id)| session_id.clone());
        if let Some(session_id) = oldest {
            self.sessions.remove(&session_id);
            debug!(session_id = %session_id, "evicted idle session history");
        }
    }

    pub(crate) fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn snapshot(&self, filter: &HistoryFilter) -> Vec<StreamItem> {
        let buffer = if filter.is_global() {
            Some(&self.global)
        } else {
            self.sessions.get(&filter.session_id)
        };
        buffer
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop the selected buffer, returning how many items it held.
    pub(crate) fn clear(&mut self, filter: &HistoryFilter) -> usize {
        if filter.is_global() {
            let cleared = self.global.len();
            self.global.clear();
            cleared
        } else {
            self.sessions
                .remove(&filter.session_id)
                .map_or(0, |items| items.len())
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.global.len() + self.sessions.values().map(VecDeque::len).sum::<usize>()
    }
}
