//! Serialized writer and deadline-aware reader over a split transport

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace};

use crate::{MessageSink, MessageSource, Transport, TransportError, TransportResult, WireMessage};

/// Split a transport into a shared writer and the single reader.
///
/// `read_timeout` is the peer liveness timeout: the reader fails if nothing at
/// all (data, ping or pong) arrives within it. `control_timeout` bounds pong
/// replies sent by the reader.
pub fn split(
    transport: Transport,
    read_timeout: Duration,
    control_timeout: Duration,
) -> (Arc<TransportWriter>, TransportReader) {
    let writer = Arc::new(TransportWriter::new(transport.sink));
    let reader = TransportReader {
        source: transport.source,
        writer: writer.clone(),
        read_timeout,
        control_timeout,
    };
    (writer, reader)
}

/// Write side of a transport, shared by every task of a session.
///
/// Each message is written while holding the lock, so frames never interleave.
pub struct TransportWriter {
    sink: Mutex<Box<dyn MessageSink>>,
    closed: AtomicBool,
    messages_sent: AtomicU64,
}

impl std::fmt::Debug for TransportWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportWriter")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("messages_sent", &self.messages_sent.load(Ordering::Relaxed))
            .finish()
    }
}

impl TransportWriter {
    pub fn new(sink: Box<dyn MessageSink>) -> Self {
        Self {
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Write one binary message. `None` waits as long as the socket needs.
    pub async fn write_message(&self, deadline: Option<Instant>, data: Bytes) -> TransportResult<()> {
        self.write(deadline, WireMessage::Binary(data)).await
    }

    pub async fn write_ping(&self, deadline: Instant) -> TransportResult<()> {
        self.write(Some(deadline), WireMessage::Ping(Bytes::new()))
            .await
    }

    pub async fn write_pong(&self, deadline: Instant, payload: Bytes) -> TransportResult<()> {
        self.write(Some(deadline), WireMessage::Pong(payload)).await
    }

    async fn write(&self, deadline: Option<Instant>, message: WireMessage) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        // The deadline covers waiting for the lock as well as the send itself.
        let send = async {
            let mut sink = self.sink.lock().await;
            sink.send(message).await
        };

        let result = match deadline {
            Some(deadline) => timeout_at(deadline, send)
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => send.await,
        };

        if result.is_ok() {
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Close the socket. Subsequent writes fail with `ConnectionClosed`.
    pub async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut sink = self.sink.lock().await;
        let _ = sink.send(WireMessage::Close).await;
        sink.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }
}

/// Read side of a transport, owned by the session's dispatch loop
pub struct TransportReader {
    source: Box<dyn MessageSource>,
    writer: Arc<TransportWriter>,
    read_timeout: Duration,
    control_timeout: Duration,
}

impl std::fmt::Debug for TransportReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportReader")
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

impl TransportReader {
    /// Wait for the next binary message.
    ///
    /// Every inbound message renews the read deadline. Pings are answered with a
    /// pong carrying the same payload.
    pub async fn next_message(&mut self) -> TransportResult<Bytes> {
        loop {
            let message = timeout(self.read_timeout, self.source.recv())
                .await
                .map_err(|_| TransportError::Timeout)??;

            match message {
                Some(WireMessage::Binary(data)) => return Ok(data),
                Some(WireMessage::Ping(payload)) => {
                    trace!("Received ping, sending pong");
                    let deadline = Instant::now() + self.control_timeout;
                    if let Err(e) = self.writer.write_pong(deadline, payload).await {
                        debug!("Failed to send pong: {}", e);
                    }
                }
                Some(WireMessage::Pong(_)) => {
                    trace!("Received pong");
                }
                Some(WireMessage::Close) | None => {
                    debug!("Transport closed by peer");
                    return Err(TransportError::ConnectionClosed);
                }
            }
        }
    }
}
