//! Prometheus recorder and the stream metrics sink.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use relay_protocol::{MessageStatus, StreamMetrics};
use tracing::info;

/// SSE frames written (counter, labels: `event_type`, `status`).
pub const SSE_MESSAGES_TOTAL: &str = "relay_sse_messages_total";
/// Bytes written to SSE clients (counter).
pub const SSE_BYTES_TOTAL: &str = "relay_sse_bytes_total";
/// Open SSE connections (gauge).
pub const SSE_CONNECTIONS_ACTIVE: &str = "relay_sse_connections_active";
/// SSE connection lifetime in seconds (histogram).
pub const SSE_CONNECTION_DURATION_SECONDS: &str = "relay_sse_connection_duration_seconds";
pub use relay_events::{BROADCAST_DROPS_TOTAL, BROADCAST_EVENTS_TOTAL};

/// Install the global Prometheus recorder.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// [`StreamMetrics`] backed by the `metrics` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusStreamMetrics;

impl StreamMetrics for PrometheusStreamMetrics {
    fn record_message(&self, event_type: &str, status: MessageStatus, bytes: usize) {
        counter!(
            SSE_MESSAGES_TOTAL,
            "event_type" => event_type.to_owned(),
            "status" => status.as_str()
        )
        .increment(1);
        if bytes > 0 {
            counter!(SSE_BYTES_TOTAL).increment(bytes as u64);
        }
    }

    fn increment_connections(&self) {
        gauge!(SSE_CONNECTIONS_ACTIVE).increment(1.0);
    }

    fn decrement_connections(&self) {
        gauge!(SSE_CONNECTIONS_ACTIVE).decrement(1.0);
    }

    fn record_connection_duration(&self, duration: Duration) {
        histogram!(SSE_CONNECTION_DURATION_SECONDS).record(duration.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_metrics_render() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            let sink = PrometheusStreamMetrics;
            sink.increment_connections();
            sink.record_message("workflow.tool.started", MessageStatus::Ok, 42);
            sink.record_message("workflow.tool.started", MessageStatus::WriteError, 0);
            sink.decrement_connections();
        });

        let output = handle.render();
        assert!(output.contains(SSE_MESSAGES_TOTAL));
        assert!(output.contains(r#"status="write_error""#));
        assert!(output.contains(SSE_BYTES_TOTAL));
    }

    #[test]
    fn metric_names_are_snake_case() {
        for name in [
            SSE_MESSAGES_TOTAL,
            SSE_BYTES_TOTAL,
            SSE_CONNECTIONS_ACTIVE,
            SSE_CONNECTION_DURATION_SECONDS,
            BROADCAST_DROPS_TOTAL,
            BROADCAST_EVENTS_TOTAL,
        ] {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
