//! One streaming connection, from handshake to close.
//!
//! ```text
//! validate ─► subscribe ─► connected frame ─► replay(global, session)
//!                                                   │
//!                 ┌─────────────────────────────────┘
//!                 ▼
//!          drain pending ─► select { cancel | event | heartbeat } ─► close
//! ```
//!
//! Every event, replayed or live, passes the admission filter, the
//! seq/id guard and the sanitizer, in that order.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::StreamExt;
use relay_events::{EventBroadcaster, HistoryFilter, StreamItem};
use relay_protocol::{
    ClientId, MessageStatus, NoopStreamMetrics, RunTracker, SessionId, StreamMetrics, event_types,
};
use serde_json::json;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::StreamConfig;
use crate::error::{StreamError, StreamResult};
use crate::filter::should_stream;
use crate::guard::DeliveryGuard;
use crate::request::{ConnectionRequest, validate_session_id};
use crate::sanitize::{ConnectionCaches, Sanitizer};
use crate::sink::{FrameSink, HEARTBEAT_FRAME, encode_event_frame};

/// Metrics label for keep-alive frames.
const HEARTBEAT_EVENT: &str = "heartbeat";

/// Why a connection stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Cancelled,
    WriteFailed,
    HeartbeatFailed,
    ChannelClosed,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::WriteFailed => "write_failed",
            Self::HeartbeatFailed => "heartbeat_failed",
            Self::ChannelClosed => "channel_closed",
        }
    }
}

/// Shared entry point for streaming connections.
pub struct StreamHandler {
    broadcaster: Arc<EventBroadcaster>,
    sanitizer: Sanitizer,
    run_tracker: Option<Arc<dyn RunTracker>>,
    metrics: Arc<dyn StreamMetrics>,
    config: StreamConfig,
}

impl StreamHandler {
    pub fn new(broadcaster: Arc<EventBroadcaster>, sanitizer: Sanitizer, config: StreamConfig) -> Self {
        Self {
            broadcaster,
            sanitizer: sanitizer.with_stream_deltas(config.stream_deltas),
            run_tracker: None,
            metrics: Arc::new(NoopStreamMetrics),
            config,
        }
    }

    pub fn with_run_tracker(mut self, tracker: Arc<dyn RunTracker>) -> Self {
        self.run_tracker = Some(tracker);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn StreamMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Run one connection until it is cancelled or the transport fails.
    ///
    /// Errors are only returned before steady state; once events flow,
    /// every ending is reported as a [`CloseReason`].
    #[instrument(
        skip_all,
        fields(session_id = %request.session_id, replay = ?request.replay, debug = request.debug)
    )]
    pub async fn serve<S>(
        &self,
        request: ConnectionRequest,
        sink: &mut S,
        cancel: CancellationToken,
    ) -> StreamResult<CloseReason>
    where
        S: FrameSink + ?Sized,
    {
        validate_session_id(request.session_id.as_str(), self.config.max_session_id_len)?;
        if !sink.supports_streaming() {
            return Err(StreamError::StreamingUnsupported);
        }

        let _tracked = ConnectionMetrics::start(Arc::clone(&self.metrics));
        let subscription = self.broadcaster.register_client(request.session_id.clone());
        let client_id = subscription.client_id;
        let _registration = Registration {
            broadcaster: &self.broadcaster,
            session_id: subscription.session_id,
            client_id,
        };
        let mut receiver = subscription.receiver;
        info!(%client_id, "stream opened");

        match self.write_connected(&request, sink, &cancel).await {
            Ok(()) => {}
            Err(WriteError::Cancelled) => {
                info!(%client_id, close_reason = "cancelled", "stream closed");
                return Ok(CloseReason::Cancelled);
            }
            Err(WriteError::Failed(error)) => {
                self.metrics
                    .record_message(event_types::CONNECTED, MessageStatus::WriteError, 0);
                warn!(%client_id, %error, "failed to write connected frame");
                return Err(StreamError::Transport(error));
            }
        }

        let mut connection = Connection::new(&self.config, request.debug);
        let reason = match self
            .replay(&request, sink, &mut connection, &cancel)
            .await
        {
            Some(reason) => reason,
            None => self.run(sink, &mut receiver, &mut connection, &cancel).await,
        };

        info!(%client_id, close_reason = reason.as_str(), "stream closed");
        Ok(reason)
    }

    async fn write_connected<S>(
        &self,
        request: &ConnectionRequest,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<(), WriteError>
    where
        S: FrameSink + ?Sized,
    {
        let active_run_id = self
            .run_tracker
            .as_ref()
            .and_then(|tracker| tracker.active_run_id(&request.session_id))
            .map(|run| run.to_string())
            .unwrap_or_default();
        let data = json!({
            "session_id": request.session_id.as_str(),
            "run_id": request.run_id.as_str(),
            "parent_run_id": request.parent_run_id.as_str(),
            "active_run_id": active_run_id,
        });
        let frame = encode_event_frame(event_types::CONNECTED, &data.to_string())
            .map_err(WriteError::Failed)?;
        let size = frame.len();
        write_and_flush(sink, frame, cancel).await?;
        self.metrics
            .record_message(event_types::CONNECTED, MessageStatus::Ok, size);
        Ok(())
    }

    /// Replay buffered history. Returns a reason when the connection ended
    /// during replay.
    async fn replay<S>(
        &self,
        request: &ConnectionRequest,
        sink: &mut S,
        connection: &mut Connection,
        cancel: &CancellationToken,
    ) -> Option<CloseReason>
    where
        S: FrameSink + ?Sized,
    {
        let mut scopes = Vec::with_capacity(2);
        if request.replay.includes_global() {
            scopes.push(HistoryFilter::global());
        }
        if request.replay.includes_session() {
            scopes.push(HistoryFilter::session(request.session_id.clone()));
        }

        for filter in scopes {
            let global = filter.is_global();
            let mut history = self
                .broadcaster
                .stream_history(filter, cancel.child_token());
            let mut replayed = 0_usize;
            while let Some(item) = history.next().await {
                if let Err(reason) = self.deliver(&item, sink, connection, cancel).await {
                    return Some(reason);
                }
                connection.raise_cutoff(global, item.offset);
                replayed += 1;
            }
            if cancel.is_cancelled() {
                return Some(CloseReason::Cancelled);
            }
            debug!(global, replayed, "history replayed");
        }
        None
    }

    async fn run<S>(
        &self,
        sink: &mut S,
        receiver: &mut mpsc::Receiver<StreamItem>,
        connection: &mut Connection,
        cancel: &CancellationToken,
    ) -> CloseReason
    where
        S: FrameSink + ?Sized,
    {
        // Whatever queued up while replay was running goes out first.
        loop {
            match receiver.try_recv() {
                Ok(item) => {
                    if let Err(reason) = self.deliver_live(&item, sink, connection, cancel).await {
                        return reason;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return CloseReason::ChannelClosed,
            }
        }

        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = time::interval_at(time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return CloseReason::Cancelled,
                item = receiver.recv() => {
                    let Some(item) = item else {
                        return CloseReason::ChannelClosed;
                    };
                    if let Err(reason) = self.deliver_live(&item, sink, connection, cancel).await {
                        return reason;
                    }
                }
                _ = heartbeat.tick() => {
                    let frame = Bytes::from_static(HEARTBEAT_FRAME.as_bytes());
                    match write_and_flush(sink, frame, cancel).await {
                        Ok(()) => {}
                        Err(WriteError::Cancelled) => return CloseReason::Cancelled,
                        Err(WriteError::Failed(error)) => {
                            warn!(%error, "heartbeat write failed");
                            self.metrics
                                .record_message(HEARTBEAT_EVENT, MessageStatus::WriteError, 0);
                            return CloseReason::HeartbeatFailed;
                        }
                    }
                }
            }
        }
    }

    async fn deliver_live<S>(
        &self,
        item: &StreamItem,
        sink: &mut S,
        connection: &mut Connection,
        cancel: &CancellationToken,
    ) -> Result<(), CloseReason>
    where
        S: FrameSink + ?Sized,
    {
        if connection.covered_by_replay(item) {
            debug!(offset = item.offset, "skipping event already replayed");
            return Ok(());
        }
        self.deliver(item, sink, connection, cancel).await
    }

    /// Filter, guard, render and write one event. Only transport failures
    /// end the connection.
    async fn deliver<S>(
        &self,
        item: &StreamItem,
        sink: &mut S,
        connection: &mut Connection,
        cancel: &CancellationToken,
    ) -> Result<(), CloseReason>
    where
        S: FrameSink + ?Sized,
    {
        let event = item.event.as_ref();
        let event_type = event.event_type();
        if !should_stream(event, connection.debug) {
            return Ok(());
        }
        if !connection.guard.admit(event) {
            debug!(
                event_type,
                run_id = %event.base().run_id(),
                seq = event.seq(),
                "duplicate or out-of-order event skipped"
            );
            return Ok(());
        }

        let frame = self
            .sanitizer
            .serialize(event, &mut connection.caches)
            .map_err(io::Error::other)
            .and_then(|data| encode_event_frame(event_type, &data));
        let frame = match frame {
            Ok(frame) => frame,
            Err(error) => {
                warn!(event_type, %error, "failed to serialize event, skipping");
                self.metrics
                    .record_message(event_type, MessageStatus::SerializationError, 0);
                return Ok(());
            }
        };

        let size = frame.len();
        match write_and_flush(sink, frame, cancel).await {
            Ok(()) => {}
            Err(WriteError::Cancelled) => return Err(CloseReason::Cancelled),
            Err(WriteError::Failed(error)) => {
                warn!(event_type, %error, "stream write failed");
                self.metrics
                    .record_message(event_type, MessageStatus::WriteError, 0);
                return Err(CloseReason::WriteFailed);
            }
        }
        self.metrics
            .record_message(event_type, MessageStatus::Ok, size);
        Ok(())
    }
}

enum WriteError {
    Cancelled,
    Failed(io::Error),
}

/// Write and flush one frame. A write that is ready completes even on a
/// cancelled token; a blocked one is abandoned once the token fires.
async fn write_and_flush<S>(
    sink: &mut S,
    frame: Bytes,
    cancel: &CancellationToken,
) -> Result<(), WriteError>
where
    S: FrameSink + ?Sized,
{
    let write = async {
        sink.write_frame(frame).await?;
        sink.flush().await
    };
    tokio::select! {
        biased;
        result = write => result.map_err(WriteError::Failed),
        () = cancel.cancelled() => Err(WriteError::Cancelled),
    }
}

/// Per-connection delivery state.
struct Connection {
    debug: bool,
    guard: DeliveryGuard,
    caches: ConnectionCaches,
    global_cutoff: u64,
    session_cutoff: u64,
}

impl Connection {
    fn new(config: &StreamConfig, debug: bool) -> Self {
        Self {
            debug,
            guard: DeliveryGuard::new(config.seen_event_capacity, config.run_seq_capacity),
            caches: ConnectionCaches::new(
                config.sent_attachment_capacity,
                config.final_answer_capacity,
            ),
            global_cutoff: 0,
            session_cutoff: 0,
        }
    }

    fn raise_cutoff(&mut self, global: bool, offset: u64) {
        let cutoff = if global {
            &mut self.global_cutoff
        } else {
            &mut self.session_cutoff
        };
        *cutoff = (*cutoff).max(offset);
    }

    /// Sessionless events live in the global history; everything else in
    /// its session's. Drop notices are generated per subscriber and never
    /// replayed.
    fn covered_by_replay(&self, item: &StreamItem) -> bool {
        if item.event.event_type() == event_types::STREAM_DROPPED {
            return false;
        }
        let cutoff = if item.event.session_id().is_empty() {
            self.global_cutoff
        } else {
            self.session_cutoff
        };
        item.offset <= cutoff
    }
}

struct Registration<'a> {
    broadcaster: &'a EventBroadcaster,
    session_id: SessionId,
    client_id: ClientId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.broadcaster
            .unregister_client(&self.session_id, self.client_id);
    }
}

struct ConnectionMetrics {
    metrics: Arc<dyn StreamMetrics>,
    started: Instant,
}

impl ConnectionMetrics {
    fn start(metrics: Arc<dyn StreamMetrics>) -> Self {
        metrics.increment_connections();
        Self {
            metrics,
            started: Instant::now(),
        }
    }
}

impl Drop for ConnectionMetrics {
    fn drop(&mut self) {
        self.metrics.decrement_connections();
        self.metrics
            .record_connection_duration(self.started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ReplayMode;
    use crate::sink::ChannelSink;
    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use relay_events::{BroadcasterConfig, InMemoryRunTracker};
    use relay_protocol::{
        AgentEvent, Attachment, AttachmentMap, EventMeta, RunId, WorkflowEventEnvelope,
    };
    use tokio::task::JoinHandle;

    #[derive(Debug, PartialEq)]
    struct Frame {
        event: String,
        data: serde_json::Value,
    }

    fn parse_frame(raw: &[u8]) -> Result<Frame> {
        let text = std::str::from_utf8(raw)?;
        let mut event = None;
        let mut data = None;
        for line in text.lines() {
            if let Some(value) = line.strip_prefix("event: ") {
                event = Some(value.to_owned());
            } else if let Some(value) = line.strip_prefix("data: ") {
                data = Some(serde_json::from_str(value)?);
            }
        }
        Ok(Frame {
            event: event.context("frame without event line")?,
            data: data.context("frame without data line")?,
        })
    }

    struct Harness {
        broadcaster: Arc<EventBroadcaster>,
        handler: Arc<StreamHandler>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(StreamConfig::default())
        }

        fn with_config(config: StreamConfig) -> Self {
            let broadcaster = Arc::new(EventBroadcaster::new(BroadcasterConfig::default()));
            let handler = Arc::new(StreamHandler::new(
                Arc::clone(&broadcaster),
                Sanitizer::new(None, None),
                config,
            ));
            Self {
                broadcaster,
                handler,
            }
        }

        /// Open a connection and wait for its connected frame.
        async fn connect(&self, request: ConnectionRequest) -> Result<Client> {
            let (mut sink, frames) = ChannelSink::channel(64);
            let handler = Arc::clone(&self.handler);
            let cancel = CancellationToken::new();
            let token = cancel.clone();
            let task =
                tokio::spawn(async move { handler.serve(request, &mut sink, token).await });
            let mut client = Client {
                frames,
                cancel,
                task,
            };
            let connected = client.next().await?;
            assert_eq!(connected.event, "connected");
            Ok(client)
        }
    }

    struct Client {
        frames: mpsc::Receiver<Bytes>,
        cancel: CancellationToken,
        task: JoinHandle<StreamResult<CloseReason>>,
    }

    impl Client {
        async fn next(&mut self) -> Result<Frame> {
            let raw = time::timeout(Duration::from_secs(2), self.frames.recv())
                .await?
                .context("stream ended")?;
            parse_frame(&raw)
        }

        async fn assert_quiet(&mut self) {
            let pending = time::timeout(Duration::from_millis(50), self.frames.recv()).await;
            assert!(pending.is_err(), "unexpected frame: {pending:?}");
        }

        async fn close(self) -> Result<CloseReason> {
            self.cancel.cancel();
            Ok(self.task.await??)
        }
    }

    fn tool_event(event: &str, seq: u64) -> AgentEvent {
        WorkflowEventEnvelope::new(
            event,
            EventMeta::new("s1")
                .with_run("r1")
                .with_seq(seq)
                .with_event_id(format!("evt-{seq}")),
        )
        .with_node("react:iter:1:tools", "tool")
        .with_payload("tool_name", "shell")
        .into()
    }

    #[tokio::test]
    async fn connected_then_events_in_order() -> Result<()> {
        let harness = Harness::new();
        let mut client = harness.connect(ConnectionRequest::new("s1")).await?;

        harness
            .broadcaster
            .publish(tool_event(event_types::TOOL_STARTED, 1));
        harness
            .broadcaster
            .publish(tool_event(event_types::TOOL_COMPLETED, 2));

        let first = client.next().await?;
        assert_eq!(first.event, "workflow.tool.started");
        assert_eq!(first.data["seq"], 1);
        let second = client.next().await?;
        assert_eq!(second.event, "workflow.tool.completed");
        assert_eq!(second.data["seq"], 2);
        client.assert_quiet().await;

        assert_eq!(client.close().await?, CloseReason::Cancelled);
        assert_eq!(harness.broadcaster.client_count(&"s1".into()), 0);
        Ok(())
    }

    #[tokio::test]
    async fn connected_frame_reports_active_run() -> Result<()> {
        let broadcaster = Arc::new(EventBroadcaster::default());
        let tracker = Arc::new(InMemoryRunTracker::new());
        tracker.set_active_run("s1".into(), RunId::from("run-7"));
        let handler = StreamHandler::new(
            Arc::clone(&broadcaster),
            Sanitizer::new(None, None),
            StreamConfig::default(),
        )
        .with_run_tracker(tracker);

        let (mut sink, mut frames) = ChannelSink::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let reason = handler
            .serve(
                ConnectionRequest::new("s1").with_replay(ReplayMode::None),
                &mut sink,
                cancel,
            )
            .await?;
        assert_eq!(reason, CloseReason::Cancelled);

        let connected = parse_frame(&frames.recv().await.context("connected frame")?)?;
        assert_eq!(connected.data["session_id"], "s1");
        assert_eq!(connected.data["active_run_id"], "run-7");
        Ok(())
    }

    #[tokio::test]
    async fn replay_precedes_live_without_duplicates() -> Result<()> {
        let harness = Harness::new();
        harness
            .broadcaster
            .publish(tool_event(event_types::TOOL_STARTED, 1));
        // Same event id republished: replay must still deliver it once.
        harness
            .broadcaster
            .publish(tool_event(event_types::TOOL_STARTED, 1));

        let mut client = harness.connect(ConnectionRequest::new("s1")).await?;
        assert_eq!(client.next().await?.data["seq"], 1);

        harness
            .broadcaster
            .publish(tool_event(event_types::TOOL_COMPLETED, 2));
        harness
            .broadcaster
            .publish(tool_event(event_types::TOOL_PROGRESS, 1));
        assert_eq!(client.next().await?.data["seq"], 2);
        client.assert_quiet().await;
        client.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn replay_none_skips_history() -> Result<()> {
        let harness = Harness::new();
        harness
            .broadcaster
            .publish(tool_event(event_types::TOOL_STARTED, 1));

        let mut client = harness
            .connect(ConnectionRequest::new("s1").with_replay(ReplayMode::None))
            .await?;
        client.assert_quiet().await;
        client.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn session_replay_excludes_global_history() -> Result<()> {
        let harness = Harness::new();
        let global: AgentEvent = WorkflowEventEnvelope::new(
            event_types::NODE_STARTED,
            EventMeta::new("").with_event_id("g1"),
        )
        .into();
        harness.broadcaster.publish(global.clone());

        let mut full = harness.connect(ConnectionRequest::new("s1")).await?;
        assert_eq!(full.next().await?.data["event_id"], "g1");

        let mut session = harness
            .connect(ConnectionRequest::new("s1").with_replay(ReplayMode::Session))
            .await?;
        session.assert_quiet().await;

        full.close().await?;
        session.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn attachments_are_sent_once_per_connection() -> Result<()> {
        let harness = Harness::new();
        let mut attachments = AttachmentMap::new();
        attachments.insert(
            "report.md".to_owned(),
            Attachment::new("report.md", "text/markdown").with_uri("https://cdn.example/r.md"),
        );
        let event = |seq: u64| -> AgentEvent {
            WorkflowEventEnvelope::new(
                event_types::NODE_OUTPUT_SUMMARY,
                EventMeta::new("s1").with_run("r1").with_seq(seq),
            )
            .with_payload("attachments", attachments.clone())
            .into()
        };

        let mut a = harness.connect(ConnectionRequest::new("s1")).await?;
        harness.broadcaster.publish(event(1));
        harness.broadcaster.publish(event(2));
        assert!(a.next().await?.data["payload"]["attachments"].is_object());
        assert!(a.next().await?.data["payload"]["attachments"].is_null());

        // A new connection starts with an empty sent set.
        let mut b = harness
            .connect(ConnectionRequest::new("s1").with_replay(ReplayMode::None))
            .await?;
        harness.broadcaster.publish(event(3));
        assert!(a.next().await?.data["payload"]["attachments"].is_null());
        assert!(b.next().await?.data["payload"]["attachments"].is_object());

        a.close().await?;
        b.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn final_answer_streams_as_deltas() -> Result<()> {
        let harness = Harness::new();
        let mut client = harness.connect(ConnectionRequest::new("s1")).await?;
        let answer = |text: &str, seq: u64| -> AgentEvent {
            WorkflowEventEnvelope::new(
                event_types::RESULT_FINAL,
                EventMeta::new("s1").with_run("r1").with_seq(seq),
            )
            .with_payload("final_answer", text)
            .with_payload("is_streaming", true)
            .with_payload("stream_finished", false)
            .into()
        };

        harness.broadcaster.publish(answer("Hello", 1));
        harness.broadcaster.publish(answer("Hello, world", 2));
        assert_eq!(
            client.next().await?.data["payload"]["final_answer"],
            "Hello"
        );
        assert_eq!(
            client.next().await?.data["payload"]["final_answer"],
            ", world"
        );
        client.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn debug_mode_unlocks_internal_nodes() -> Result<()> {
        let harness = Harness::new();
        let internal = || -> AgentEvent {
            WorkflowEventEnvelope::new(event_types::NODE_STARTED, EventMeta::new("s1"))
                .with_node("react:context", "step")
                .into()
        };

        let mut plain = harness.connect(ConnectionRequest::new("s1")).await?;
        let mut debug = harness
            .connect(ConnectionRequest::new("s1").with_debug(true))
            .await?;
        harness.broadcaster.publish(internal());

        assert_eq!(debug.next().await?.data["node_id"], "react:context");
        plain.assert_quiet().await;
        plain.close().await?;
        debug.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn heartbeat_keeps_idle_connection_alive() -> Result<()> {
        let harness = Harness::with_config(StreamConfig {
            heartbeat_interval: Duration::from_millis(20),
            ..StreamConfig::default()
        });
        let mut client = harness.connect(ConnectionRequest::new("s1")).await?;

        let raw = time::timeout(Duration::from_secs(2), client.frames.recv())
            .await?
            .context("heartbeat")?;
        assert_eq!(&raw[..], HEARTBEAT_FRAME.as_bytes());
        client.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn dropped_client_ends_with_write_failure() -> Result<()> {
        let harness = Harness::new();
        let client = harness.connect(ConnectionRequest::new("s1")).await?;
        let Client { frames, task, .. } = client;
        drop(frames);

        harness
            .broadcaster
            .publish(tool_event(event_types::TOOL_STARTED, 1));
        let reason = time::timeout(Duration::from_secs(2), task).await???;
        assert_eq!(reason, CloseReason::WriteFailed);
        assert_eq!(harness.broadcaster.client_count(&"s1".into()), 0);
        Ok(())
    }

    struct BufferedSink;

    #[async_trait]
    impl FrameSink for BufferedSink {
        async fn write_frame(&mut self, _frame: Bytes) -> io::Result<()> {
            Ok(())
        }

        async fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn supports_streaming(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn non_streaming_sink_is_rejected_before_subscribing() -> Result<()> {
        let harness = Harness::new();
        let result = harness
            .handler
            .serve(
                ConnectionRequest::new("s1"),
                &mut BufferedSink,
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(StreamError::StreamingUnsupported)));
        assert_eq!(harness.broadcaster.metrics().total_connections, 0);
        Ok(())
    }

    #[derive(Default)]
    struct RecordingMetrics {
        messages: Mutex<Vec<(String, MessageStatus)>>,
        active: Mutex<i64>,
    }

    impl StreamMetrics for RecordingMetrics {
        fn record_message(&self, event_type: &str, status: MessageStatus, _bytes: usize) {
            self.messages.lock().push((event_type.to_owned(), status));
        }

        fn increment_connections(&self) {
            *self.active.lock() += 1;
        }

        fn decrement_connections(&self) {
            *self.active.lock() -= 1;
        }

        fn record_connection_duration(&self, _duration: Duration) {}
    }

    #[tokio::test]
    async fn metrics_track_frames_and_connections() -> Result<()> {
        let broadcaster = Arc::new(EventBroadcaster::default());
        let metrics = Arc::new(RecordingMetrics::default());
        let handler = Arc::new(
            StreamHandler::new(
                Arc::clone(&broadcaster),
                Sanitizer::new(None, None),
                StreamConfig::default(),
            )
            .with_metrics(metrics.clone()),
        );
        broadcaster.publish(tool_event(event_types::TOOL_STARTED, 1));

        let (mut sink, mut frames) = ChannelSink::channel(8);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let serving = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.serve(ConnectionRequest::new("s1"), &mut sink, token).await })
        };
        frames.recv().await.context("connected")?;
        frames.recv().await.context("replayed event")?;
        assert_eq!(*metrics.active.lock(), 1);

        cancel.cancel();
        serving.await??;
        assert_eq!(*metrics.active.lock(), 0);
        let messages = metrics.messages.lock();
        assert_eq!(
            messages.as_slice(),
            &[
                ("connected".to_owned(), MessageStatus::Ok),
                ("workflow.tool.started".to_owned(), MessageStatus::Ok),
            ]
        );
        Ok(())
    }
    #[tokio::test]
    async fn failed_heartbeat_is_recorded() -> Result<()> {
        let broadcaster = Arc::new(EventBroadcaster::default());
        let metrics = Arc::new(RecordingMetrics::default());
        let handler = StreamHandler::new(
            Arc::clone(&broadcaster),
            Sanitizer::new(None, None),
            StreamConfig {
                heartbeat_interval: Duration::from_millis(20),
                ..StreamConfig::default()
            },
        )
        .with_metrics(metrics.clone());

        let (mut sink, mut frames) = ChannelSink::channel(8);
        let serving = tokio::spawn(async move {
            handler
                .serve(
                    ConnectionRequest::new("s1").with_replay(ReplayMode::None),
                    &mut sink,
                    CancellationToken::new(),
                )
                .await
        });
        frames.recv().await.context("connected")?;
        drop(frames);

        let reason = time::timeout(Duration::from_secs(2), serving).await???;
        assert_eq!(reason, CloseReason::HeartbeatFailed);
        assert_eq!(*metrics.active.lock(), 0);
        assert_eq!(
            metrics.messages.lock().last(),
            Some(&("heartbeat".to_owned(), MessageStatus::WriteError))
        );
        assert_eq!(broadcaster.client_count(&"s1".into()), 0);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_session_ids_never_subscribe() -> Result<()> {
        let harness = Harness::new();
        let too_long = "s".repeat(StreamConfig::default().max_session_id_len + 1);
        for session_id in ["", "   ", "../etc", "a b", too_long.as_str()] {
            let (mut sink, mut frames) = ChannelSink::channel(8);
            let result = harness
                .handler
                .serve(
                    ConnectionRequest::new(session_id).with_replay(ReplayMode::None),
                    &mut sink,
                    CancellationToken::new(),
                )
                .await;
            assert!(
                matches!(result, Err(StreamError::InvalidSessionId(_))),
                "{session_id:?} was accepted"
            );
            drop(sink);
            assert!(frames.recv().await.is_none(), "{session_id:?} got a frame");
        }
        assert_eq!(harness.broadcaster.metrics().total_connections, 0);
        assert_eq!(harness.broadcaster.metrics().active_connections, 0);
        Ok(())
    }

    #[tokio::test]
    async fn sessionless_request_cannot_observe_other_sessions() -> Result<()> {
        let harness = Harness::new();
        let (mut sink, mut frames) = ChannelSink::channel(8);
        let result = harness
            .handler
            .serve(ConnectionRequest::new(""), &mut sink, CancellationToken::new())
            .await;
        assert!(result.is_err());

        harness
            .broadcaster
            .publish(tool_event(event_types::TOOL_STARTED, 1));
        drop(sink);
        assert!(frames.recv().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn cancel_while_write_blocked() -> Result<()> {
        let harness = Harness::new();
        // Room for the connected frame only; nothing is ever read.
        let (mut sink, _frames) = ChannelSink::channel(1);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handler = Arc::clone(&harness.handler);
        let serving = tokio::spawn(async move {
            handler
                .serve(
                    ConnectionRequest::new("s1").with_replay(ReplayMode::None),
                    &mut sink,
                    token,
                )
                .await
        });

        for _ in 0..100 {
            if harness.broadcaster.client_count(&"s1".into()) == 1 {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        harness
            .broadcaster
            .publish(tool_event(event_types::TOOL_STARTED, 1));
        time::sleep(Duration::from_millis(50)).await;
        assert!(!serving.is_finished(), "write should be blocked");

        cancel.cancel();
        let reason = time::timeout(Duration::from_secs(2), serving).await???;
        assert_eq!(reason, CloseReason::Cancelled);
        assert_eq!(harness.broadcaster.client_count(&"s1".into()), 0);
        Ok(())
    }
}
