//! Message transport abstraction for tunnel sessions
//!
//! A session runs over one bidirectional, message-oriented socket. The socket
//! is split into a [`MessageSink`] and a [`MessageSource`] so one task can read
//! while many others write. [`wrapper`] serializes the writers and enforces the
//! read deadline; [`memory`] provides an in-process pair for tests and embedding.

pub mod memory;
pub mod wrapper;

pub use wrapper::{split, TransportReader, TransportWriter};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// One message on the physical socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

/// Write half of a message transport
#[async_trait]
pub trait MessageSink: Send {
    /// Send one complete message
    async fn send(&mut self, message: WireMessage) -> TransportResult<()>;

    /// Close the write half
    async fn close(&mut self) -> TransportResult<()>;
}

/// Read half of a message transport
#[async_trait]
pub trait MessageSource: Send {
    /// Receive the next message, `None` once the peer has gone away
    async fn recv(&mut self) -> TransportResult<Option<WireMessage>>;
}

/// An established transport, already authenticated and upgraded
pub struct Transport {
    pub sink: Box<dyn MessageSink>,
    pub source: Box<dyn MessageSource>,
}

impl Transport {
    pub fn new(sink: impl MessageSink + 'static, source: impl MessageSource + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}
