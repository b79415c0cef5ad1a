//! Transport boundary for SSE frames.
//!
//! The connection loop only ever writes whole frames and flushes; the HTTP
//! layer decides what a write means (a body chunk, a test buffer, ...).

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Comment frame written on every heartbeat tick.
pub const HEARTBEAT_FRAME: &str = ": heartbeat\n\n";

#[async_trait]
pub trait FrameSink: Send {
    async fn write_frame(&mut self, frame: Bytes) -> io::Result<()>;

    async fn flush(&mut self) -> io::Result<()>;

    /// False when the transport cannot deliver incremental writes.
    fn supports_streaming(&self) -> bool {
        true
    }
}

/// Encode one `event:`/`data:` frame. `data` must be single-line JSON.
pub fn encode_event_frame(event_type: &str, data: &str) -> io::Result<Bytes> {
    if event_type.contains(['\r', '\n']) || data.contains(['\r', '\n']) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "sse frame fields must not contain line breaks",
        ));
    }
    Ok(Bytes::from(format!("event: {event_type}\ndata: {data}\n\n")))
}

/// Sink backed by a bounded channel; the receiver feeds the response body.
///
/// A dropped receiver surfaces as `BrokenPipe`, which ends the connection.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving half, with room for `capacity` frames.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Resolves once the receiving half has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn write_frame(&mut self, frame: Bytes) -> io::Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stream receiver dropped"))
    }

    // Frames are handed to the body as soon as they are sent.
    async fn flush(&mut self) -> io::Result<()> {
        if self.tx.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream receiver dropped",
            ));
        }
        Ok(())
    }
}
