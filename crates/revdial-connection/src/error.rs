//! Connection and session errors

use revdial_proto::{FrameError, RemoteError};
use revdial_transport::TransportError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Terminal error of a virtual connection.
///
/// Cloned to every reader and writer that observes it after the close.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnError {
    /// Clean shutdown
    #[error("EOF")]
    Eof,

    #[error("io: read/write on closed pipe")]
    ClosedPipe,

    #[error("tunnel disconnect")]
    TunnelDisconnect,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("write timeout")]
    WriteTimeout,

    #[error("connection closed: no longer active on the client")]
    Stale,

    #[error("dial {address} failed: {reason}")]
    Dial { address: String, reason: String },

    /// Error reported by the peer in an Error frame
    #[error("{0}")]
    Remote(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("{0}")]
    Io(String),
}

impl ConnError {
    pub fn from_remote(err: RemoteError) -> Self {
        match err {
            RemoteError::Eof => ConnError::Eof,
            RemoteError::Message(msg) => ConnError::Remote(msg),
        }
    }

    pub fn to_remote(&self) -> RemoteError {
        match self {
            ConnError::Eof => RemoteError::Eof,
            other => RemoteError::Message(other.to_string()),
        }
    }

    pub fn io_kind(&self) -> io::ErrorKind {
        match self {
            ConnError::Eof => io::ErrorKind::UnexpectedEof,
            ConnError::ClosedPipe => io::ErrorKind::BrokenPipe,
            ConnError::TunnelDisconnect | ConnError::Stale => io::ErrorKind::ConnectionAborted,
            ConnError::DeadlineExceeded | ConnError::WriteTimeout => io::ErrorKind::TimedOut,
            ConnError::Dial { .. } => io::ErrorKind::ConnectionRefused,
            ConnError::Remote(_) => io::ErrorKind::ConnectionReset,
            ConnError::Transport(_) | ConnError::Io(_) => io::ErrorKind::Other,
        }
    }
}

impl From<ConnError> for io::Error {
    fn from(err: ConnError) -> Self {
        io::Error::new(err.io_kind(), err)
    }
}

impl From<io::Error> for ConnError {
    fn from(err: io::Error) -> Self {
        if let Some(inner) = err.get_ref().and_then(|e| e.downcast_ref::<ConnError>()) {
            return inner.clone();
        }
        ConnError::Io(err.to_string())
    }
}

impl From<TransportError> for ConnError {
    fn from(err: TransportError) -> Self {
        ConnError::Transport(err.to_string())
    }
}

/// Errors that end a whole session or fail a dial through it
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Session closed")]
    Closed,

    #[error("Session is already being served")]
    AlreadyServing,

    #[error("Dial timed out after {0:?}")]
    DialTimeout(Duration),

    #[error("Dial task failed: {0}")]
    DialTask(String),
}
