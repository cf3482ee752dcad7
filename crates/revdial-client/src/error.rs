use revdial_connection::SessionError;
use revdial_transport::TransportError;
use std::fmt::Display;
use thiserror::Error;

use crate::reconnect::ReconnectError;

/// Why a tunnel connection attempt ended
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Failed to connect: {0}")]
    Transport(#[from] TransportError),

    #[error("Session failed: {0}")]
    Session(#[from] SessionError),

    #[error("Invalid header value: {0}")]
    InvalidHeader(String),

    #[error("on_connect failed: {0}")]
    Callback(String),

    #[error(transparent)]
    Reconnect(#[from] ReconnectError),

    #[error("Connection cancelled")]
    Cancelled,
}

impl ConnectError {
    /// Error for an `on_connect` callback to return
    pub fn callback(err: impl Display) -> Self {
        Self::Callback(err.to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Reconnect(ReconnectError::Cancelled)
        )
    }
}
