use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use futures_util::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_cache::{AttachmentStore, CacheError, DataCache, content_type_for_filename};
use relay_events::{BroadcasterConfig, EventBroadcaster, InMemoryRunTracker, PublishReport};
use relay_protocol::{AgentEvent, PayloadValue, event_types};
use relay_stream::{
    ChannelSink, ConnectionRequest, Sanitizer, StreamConfig, StreamError, StreamHandler,
    StreamQuery,
};
use serde::Serialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

mod metrics;

use crate::metrics::PrometheusStreamMetrics;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");
const IMMUTABLE_CACHE: &str = "public, max-age=31536000, immutable";

#[derive(Debug, Parser)]
#[command(name = "relay-api")]
#[command(about = "Session-scoped SSE relay for agent workflow events")]
struct Cli {
    #[arg(long, env = "RELAY_LISTEN", default_value = "127.0.0.1:8787")]
    listen: SocketAddr,
    #[arg(
        long,
        env = "RELAY_ATTACHMENTS_DIR",
        default_value = "~/.relay/attachments"
    )]
    attachments_dir: PathBuf,
    #[arg(long, env = "RELAY_DATA_CACHE_CAPACITY", default_value_t = 512)]
    data_cache_capacity: usize,
    #[arg(long, env = "RELAY_DATA_CACHE_TTL_SECS", default_value_t = 1800)]
    data_cache_ttl_secs: u64,
    #[arg(long, env = "RELAY_HISTORY_LIMIT", default_value_t = 1000)]
    history_limit: usize,
    #[arg(long, env = "RELAY_HEARTBEAT_SECS", default_value_t = 30)]
    heartbeat_secs: u64,
    #[arg(long, env = "RELAY_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    request_timeout_secs: u64,
    /// Send the full final answer on every frame instead of deltas.
    #[arg(long, env = "RELAY_NO_STREAM_DELTAS")]
    no_stream_deltas: bool,
}

#[derive(Clone)]
struct AppState {
    broadcaster: Arc<EventBroadcaster>,
    handler: Arc<StreamHandler>,
    data_cache: Arc<DataCache>,
    store: Arc<AttachmentStore>,
    run_tracker: Arc<InMemoryRunTracker>,
    prometheus: Option<PrometheusHandle>,
    // Cancelled on shutdown; every connection holds a child token.
    shutdown: CancellationToken,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(error: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: error.to_string(),
        }
    }
}

impl From<CacheError> for ApiError {
    fn from(error: CacheError) -> Self {
        match error {
            CacheError::InvalidFilename(_) | CacheError::EmptyPayload => {
                Self::bad_request(error.to_string())
            }
            CacheError::NotFound(_) => Self::not_found(error.to_string()),
            CacheError::Io { .. } => Self::internal(error),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
struct PublishResponse {
    offset: u64,
    delivered: usize,
    dropped: usize,
}

impl From<PublishReport> for PublishResponse {
    fn from(report: PublishReport) -> Self {
        Self {
            offset: report.offset,
            delivered: report.delivered,
            dropped: report.dropped,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let prometheus = metrics::install_recorder()?;

    let store = Arc::new(AttachmentStore::open(&cli.attachments_dir)?);
    let data_cache = Arc::new(DataCache::new(
        cli.data_cache_capacity,
        Duration::from_secs(cli.data_cache_ttl_secs),
    ));
    let stream_config = StreamConfig {
        heartbeat_interval: Duration::from_secs(cli.heartbeat_secs),
        stream_deltas: !cli.no_stream_deltas,
        ..StreamConfig::default()
    };
    let broadcaster = Arc::new(EventBroadcaster::new(BroadcasterConfig {
        history_limit: cli.history_limit,
        channel_capacity: stream_config.channel_capacity,
        ..BroadcasterConfig::default()
    }));
    let run_tracker = Arc::new(InMemoryRunTracker::new());
    let handler = StreamHandler::new(
        Arc::clone(&broadcaster),
        Sanitizer::new(Some(Arc::clone(&data_cache)), Some(Arc::clone(&store))),
        stream_config,
    )
    .with_run_tracker(run_tracker.clone())
    .with_metrics(Arc::new(PrometheusStreamMetrics));

    let shutdown = CancellationToken::new();
    let state = AppState {
        broadcaster,
        handler: Arc::new(handler),
        data_cache,
        store,
        run_tracker,
        prometheus: Some(prometheus),
        shutdown: shutdown.clone(),
    };
    let app = build_router(state, Duration::from_secs(cli.request_timeout_secs));

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(
        listen = %cli.listen,
        attachments_dir = %cli.attachments_dir.display(),
        "relay-api listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await?;

    Ok(())
}

/// The SSE route is mounted outside the timeout layer; it has no deadline.
fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let bounded = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_text))
        .route("/api/data/{id}", get(get_data))
        .route("/api/attachments/{filename}", get(get_attachment))
        .route("/api/events", post(publish_event))
        .layer(TimeoutLayer::new(request_timeout));

    Router::new()
        .route("/api/sse", get(stream_sse))
        .merge(bounded)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "relay-api",
        "broadcaster": state.broadcaster.metrics(),
        "data_cache_entries": state.data_cache.len(),
    }))
}

async fn metrics_text(State(state): State<AppState>) -> Response {
    let body = state
        .prometheus
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

async fn stream_sse(State(state): State<AppState>, Query(query): Query<StreamQuery>) -> Response {
    let config = state.handler.config();
    let request = match ConnectionRequest::from_query(&query, config.max_session_id_len) {
        Ok(request) => request,
        Err(error) => {
            debug!(%error, "rejected stream request");
            return (StatusCode::BAD_REQUEST, error.to_string()).into_response();
        }
    };

    let (sink, frames) = ChannelSink::channel(config.channel_capacity);
    let cancel = state.shutdown.child_token();
    tokio::spawn(serve_connection(
        Arc::clone(&state.handler),
        request,
        sink,
        cancel,
    ));

    let body = Body::from_stream(ReceiverStream::new(frames).map(Ok::<_, Infallible>));
    (
        [
            (CONTENT_TYPE, HeaderValue::from_static("text/event-stream")),
            (CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (CONNECTION, HeaderValue::from_static("keep-alive")),
            (X_ACCEL_BUFFERING, HeaderValue::from_static("no")),
        ],
        body,
    )
        .into_response()
}

/// Drive one connection. Dropping the response body closes the frame
/// channel, which cancels the connection.
async fn serve_connection(
    handler: Arc<StreamHandler>,
    request: ConnectionRequest,
    mut sink: ChannelSink,
    cancel: CancellationToken,
) {
    let watcher = sink.clone();
    let watch = async {
        tokio::select! {
            () = watcher.closed() => cancel.cancel(),
            () = cancel.cancelled() => {}
        }
    };
    let serve = async {
        let outcome = handler.serve(request, &mut sink, cancel.clone()).await;
        cancel.cancel();
        outcome
    };
    let ((), outcome) = tokio::join!(watch, serve);

    match outcome {
        Ok(reason) => debug!(close_reason = reason.as_str(), "connection task finished"),
        Err(StreamError::Transport(error)) if error.kind() == io::ErrorKind::BrokenPipe => {
            debug!("client left before the handshake")
        }
        Err(error) => warn!(%error, "connection failed"),
    }
}

async fn get_data(Path(id): Path<String>, State(state): State<AppState>) -> ApiResult<Response> {
    let entry = state
        .data_cache
        .get(&id)
        .ok_or_else(|| ApiError::not_found("data not found"))?;
    Ok((
        [(CONTENT_TYPE, entry.content_type)],
        Bytes::copy_from_slice(&entry.bytes),
    )
        .into_response())
}

async fn get_attachment(
    Path(filename): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Response> {
    let path = state.store.resolve(&filename)?;
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            return Err(ApiError::not_found("attachment not found"));
        }
        Err(error) => return Err(ApiError::internal(error)),
    };
    Ok((
        [
            (CONTENT_TYPE, content_type_for_filename(&filename)),
            (CACHE_CONTROL, IMMUTABLE_CACHE),
        ],
        bytes,
    )
        .into_response())
}

/// Ingress for producers: publish one JSON-encoded event.
async fn publish_event(
    State(state): State<AppState>,
    body: String,
) -> ApiResult<Json<PublishResponse>> {
    let event =
        AgentEvent::from_json(&body).map_err(|error| ApiError::bad_request(error.to_string()))?;
    track_run(&state.run_tracker, &event);
    let report = state.broadcaster.publish(event);
    Ok(Json(report.into()))
}

/// Keep the active run per session current from the events flowing through.
fn track_run(tracker: &InMemoryRunTracker, event: &AgentEvent) {
    let session_id = event.session_id();
    let run_id = event.run_id();
    if session_id.is_empty() || run_id.is_empty() {
        return;
    }
    let finished = match event.event_type() {
        event_types::RESULT_CANCELLED => true,
        event_types::RESULT_FINAL => event
            .as_envelope()
            .and_then(|envelope| envelope.payload.get("stream_finished"))
            .and_then(PayloadValue::as_bool)
            .unwrap_or(false),
        _ => false,
    };
    if finished {
        tracker.clear_active_run(session_id, run_id);
    } else {
        tracker.set_active_run(session_id.clone(), run_id.clone());
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }

    info!("shutdown signal received");
}
