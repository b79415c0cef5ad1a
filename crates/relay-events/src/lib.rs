//! Process-wide event fan-out keyed by session.
//!
//! Producers call [`EventBroadcaster::publish`]; each streaming connection
//! owns one bounded receiver obtained from
//! [`EventBroadcaster::register_client`]. Publishing never waits on a slow
//! subscriber: a full channel drops the event for that subscriber only and
//! a `workflow.stream.dropped` notice is queued ahead of its next delivery.

mod history;
mod run_tracker;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_stream::stream;
use futures_util::stream::BoxStream;
use metrics::counter;
use parking_lot::Mutex;
use relay_protocol::{
    AgentEvent, ClientId, EventMeta, PayloadValue, SessionId, WorkflowEventEnvelope, event_types,
};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

pub use history::HistoryFilter;
pub use run_tracker::InMemoryRunTracker;

use history::HistoryBuffer;

pub const BROADCAST_EVENTS_TOTAL: &str = "relay_broadcast_events_total";
pub const BROADCAST_DROPS_TOTAL: &str = "relay_broadcast_drops_total";

/// One published event as seen by a subscriber.
///
/// `offset` is assigned at publish time, is unique, and increases in
/// publish order across the whole process. History keeps the same offset.
#[derive(Debug, Clone)]
pub struct StreamItem {
    pub offset: u64,
    pub event: Arc<AgentEvent>,
}

#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Items retained per session buffer and in the global buffer.
    pub history_limit: usize,
    /// Session history buffers kept before idle sessions are evicted.
    pub max_history_sessions: usize,
    pub channel_capacity: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            history_limit: 1000,
            max_history_sessions: 1024,
            channel_capacity: 100,
        }
    }
}

/// Receiving half handed to a registered client.
#[derive(Debug)]
pub struct Subscription {
    pub client_id: ClientId,
    pub session_id: SessionId,
    pub receiver: mpsc::Receiver<StreamItem>,
}

/// Result of a single publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub offset: u64,
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcasterMetrics {
    pub total_events_sent: u64,
    pub dropped_events: u64,
    pub total_connections: u64,
    pub active_connections: usize,
    pub session_count: usize,
    pub history_depth: usize,
}

#[derive(Debug)]
struct Subscriber {
    id: ClientId,
    sender: mpsc::Sender<StreamItem>,
    pending_drops: u64,
}

enum Delivery {
    Sent,
    Dropped,
    Closed,
}

impl Subscriber {
    fn deliver(&mut self, item: &StreamItem, session_id: &SessionId) -> Delivery {
        if self.pending_drops > 0 {
            let notice = dropped_notice(item.offset, session_id, self.pending_drops);
            match self.sender.try_send(notice) {
                Ok(()) => self.pending_drops = 0,
                Err(TrySendError::Full(_)) => {
                    self.pending_drops += 1;
                    return Delivery::Dropped;
                }
                Err(TrySendError::Closed(_)) => return Delivery::Closed,
            }
        }
        match self.sender.try_send(item.clone()) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => {
                self.pending_drops += 1;
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

#[derive(Debug)]
struct Registry {
    sessions: HashMap<SessionId, Vec<Subscriber>>,
    // Cross-session observers; they receive every event.
    global: Vec<Subscriber>,
    history: HistoryBuffer,
    next_offset: u64,
}

impl Registry {
    fn active_connections(&self) -> usize {
        self.global.len() + self.sessions.values().map(Vec::len).sum::<usize>()
    }
}

#[derive(Debug)]
pub struct EventBroadcaster {
    config: BroadcasterConfig,
    registry: Mutex<Registry>,
    next_client: AtomicU64,
    total_events_sent: AtomicU64,
    dropped_events: AtomicU64,
    total_connections: AtomicU64,
}

impl EventBroadcaster {
    pub fn new(config: BroadcasterConfig) -> Self {
        let history = HistoryBuffer::new(config.history_limit, config.max_history_sessions);
        Self {
            config,
            registry: Mutex::new(Registry {
                sessions: HashMap::new(),
                global: Vec::new(),
                history,
                next_offset: 1,
            }),
            next_client: AtomicU64::new(1),
            total_events_sent: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
        }
    }

    /// Register a bounded channel for `session_id`.
    ///
    /// An empty session id registers a global subscriber.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn register_client(&self, session_id: SessionId) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.config.channel_capacity.max(1));
        let client_id = ClientId::new(self.next_client.fetch_add(1, Ordering::Relaxed));
        let subscriber = Subscriber {
            id: client_id,
            sender,
            pending_drops: 0,
        };

        let mut registry = self.registry.lock();
        if session_id.is_empty() {
            registry.global.push(subscriber);
        } else {
            registry
                .sessions
                .entry(session_id.clone())
                .or_default()
                .push(subscriber);
        }
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        debug!(%client_id, "client registered");

        Subscription {
            client_id,
            session_id,
            receiver,
        }
    }

    /// Register an observer that receives events from every session.
    pub fn register_global(&self) -> Subscription {
        self.register_client(SessionId::default())
    }

    /// Remove a client. Returns false when it was already gone.
    #[instrument(skip(self), fields(session_id = %session_id, client_id = %client_id))]
    pub fn unregister_client(&self, session_id: &SessionId, client_id: ClientId) -> bool {
        let mut registry = self.registry.lock();
        let removed = if session_id.is_empty() {
            remove_subscriber(&mut registry.global, client_id)
        } else {
            let Some(clients) = registry.sessions.get_mut(session_id) else {
                return false;
            };
            let removed = remove_subscriber(clients, client_id);
            if clients.is_empty() {
                registry.sessions.remove(session_id);
            }
            removed
        };
        if removed {
            debug!("client unregistered");
        }
        removed
    }

    /// Record `event` in history and fan it out without blocking.
    pub fn publish(&self, event: AgentEvent) -> PublishReport {
        let session_id = event.session_id().clone();
        let event_type = event.event_type().to_owned();
        let mut registry = self.registry.lock();

        let item = StreamItem {
            offset: registry.next_offset,
            event: Arc::new(event),
        };
        registry.next_offset += 1;
        {
            let Registry {
                sessions, history, ..
            } = &mut *registry;
            history.record(&session_id, &item, |id| sessions.contains_key(id));
        }

        let mut report = PublishReport {
            offset: item.offset,
            ..PublishReport::default()
        };
        let Registry {
            sessions, global, ..
        } = &mut *registry;

        if session_id.is_empty() {
            for (session, clients) in sessions.iter_mut() {
                fan_out(clients, &item, session, &mut report);
            }
        } else if let Some(clients) = sessions.get_mut(&session_id) {
            fan_out(clients, &item, &session_id, &mut report);
        }
        fan_out(global, &item, &SessionId::default(), &mut report);
        sessions.retain(|_, clients| !clients.is_empty());
        drop(registry);

        counter!(BROADCAST_EVENTS_TOTAL).increment(1);
        self.total_events_sent
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        if report.dropped > 0 {
            self.dropped_events
                .fetch_add(report.dropped as u64, Ordering::Relaxed);
            counter!(BROADCAST_DROPS_TOTAL).increment(report.dropped as u64);
            warn!(
                session_id = %session_id,
                event_type = %event_type,
                dropped = report.dropped,
                "subscriber channel full, event dropped"
            );
        }
        debug!(
            session_id = %session_id,
            event_type = %event_type,
            offset = report.offset,
            delivered = report.delivered,
            "event published"
        );
        report
    }

    /// Buffered history for `filter`, in publish order.
    pub fn history(&self, filter: &HistoryFilter) -> Vec<StreamItem> {
        self.registry.lock().history.snapshot(filter)
    }

    /// Replay buffered history matching `filter`.
    ///
    /// The buffer is snapshotted on call; the stream ends early once
    /// `cancel` fires.
    pub fn stream_history(
        &self,
        filter: HistoryFilter,
        cancel: CancellationToken,
    ) -> BoxStream<'static, StreamItem> {
        let snapshot = self.history(&filter);
        Box::pin(stream! {
            for item in snapshot {
                if cancel.is_cancelled() {
                    debug!(session_id = %filter.session_id, "history replay cancelled");
                    break;
                }
                yield item;
            }
        })
    }

    /// Drop buffered history for `filter`, returning the number of items.
    pub fn clear_history(&self, filter: &HistoryFilter) -> usize {
        self.registry.lock().history.clear(filter)
    }

    pub fn client_count(&self, session_id: &SessionId) -> usize {
        let registry = self.registry.lock();
        if session_id.is_empty() {
            registry.global.len()
        } else {
            registry.sessions.get(session_id).map_or(0, Vec::len)
        }
    }

    pub fn session_count(&self) -> usize {
        self.registry.lock().sessions.len()
    }

    pub fn metrics(&self) -> BroadcasterMetrics {
        let registry = self.registry.lock();
        BroadcasterMetrics {
            total_events_sent: self.total_events_sent.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: registry.active_connections(),
            session_count: registry.sessions.len(),
            history_depth: registry.history.depth(),
        }
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(BroadcasterConfig::default())
    }
}

fn fan_out(
    clients: &mut Vec<Subscriber>,
    item: &StreamItem,
    session_id: &SessionId,
    report: &mut PublishReport,
) {
    clients.retain_mut(|client| match client.deliver(item, session_id) {
        Delivery::Sent => {
            report.delivered += 1;
            true
        }
        Delivery::Dropped => {
            report.dropped += 1;
            true
        }
        Delivery::Closed => {
            debug!(client_id = %client.id, "pruned closed subscriber");
            false
        }
    });
}

fn remove_subscriber(clients: &mut Vec<Subscriber>, client_id: ClientId) -> bool {
    let before = clients.len();
    clients.retain(|client| client.id != client_id);
    clients.len() != before
}

fn dropped_notice(offset: u64, session_id: &SessionId, dropped: u64) -> StreamItem {
    let envelope = WorkflowEventEnvelope::new(
        event_types::STREAM_DROPPED,
        EventMeta::new(session_id.clone()),
    )
    .with_payload("dropped", PayloadValue::from(dropped))
    .with_payload("session_id", session_id.as_str());
    StreamItem {
        offset,
        event: Arc::new(envelope.into()),
    }
}
