//! Tunnel frame encoding and decoding
//!
//! Frame format (one transport message per frame):
//! - varint: frame ID (diagnostics only)
//! - varint: connection ID (0 = session control)
//! - varint: frame type
//! - varint: legacy field, only for Data and Connect
//! - rest: type-specific payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;

use crate::varint::{get_varint, put_varint, MAX_VARINT_LEN};
use crate::{CONTROL_CONN_ID, LEGACY_DEADLINE_MILLIS, MAX_CONTROL_PAYLOAD};

static NEXT_FRAME_ID: AtomicI64 = AtomicI64::new(0);

/// Allocate the next process-wide frame ID
pub fn next_frame_id() -> i64 {
    NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed) + 1
}

/// Frame decoding and encoding errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame truncated")]
    Truncated,

    #[error("Varint overflows 64 bits")]
    VarintOverflow,

    #[error("Unknown frame type: {0}")]
    UnknownType(i64),

    #[error("Invalid connect payload, missing '/': {0:?}")]
    InvalidConnect(String),

    #[error("Invalid client key payload: {0:?}")]
    InvalidClientKey(String),

    #[error("SyncConnections payload length {0} is not a multiple of 8")]
    MisalignedSync(usize),

    #[error("Control payload too long: {0} bytes (max 100)")]
    PayloadTooLong(usize),
}

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum FrameType {
    Data = 1,
    Connect = 2,
    Error = 3,
    AddClient = 4,
    RemoveClient = 5,
    Pause = 6,
    Resume = 7,
    SyncConnections = 8,
}

impl FrameType {
    /// Whether the legacy header field follows the type
    pub fn has_legacy_field(self) -> bool {
        matches!(self, FrameType::Data | FrameType::Connect)
    }
}

impl TryFrom<i64> for FrameType {
    type Error = FrameError;

    fn try_from(value: i64) -> Result<Self, FrameError> {
        match value {
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Connect),
            3 => Ok(FrameType::Error),
            4 => Ok(FrameType::AddClient),
            5 => Ok(FrameType::RemoveClient),
            6 => Ok(FrameType::Pause),
            7 => Ok(FrameType::Resume),
            8 => Ok(FrameType::SyncConnections),
            _ => Err(FrameError::UnknownType(value)),
        }
    }
}

/// A client reachable through a peer session: `"clientKey/sessionKey"` on the wire
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub client_key: String,
    pub session_key: i64,
}

impl ClientKey {
    pub fn new(client_key: impl Into<String>, session_key: i64) -> Self {
        Self {
            client_key: client_key.into(),
            session_key,
        }
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client_key, self.session_key)
    }
}

impl FromStr for ClientKey {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (client_key, session_key) = s
            .rsplit_once('/')
            .ok_or_else(|| FrameError::InvalidClientKey(s.to_string()))?;

        let session_key = session_key
            .parse::<i64>()
            .map_err(|_| FrameError::InvalidClientKey(s.to_string()))?;

        Ok(Self::new(client_key, session_key))
    }
}

/// Error carried by an Error frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Clean shutdown, `"EOF"` on the wire
    Eof,
    /// Any other failure, as text
    Message(String),
}

impl RemoteError {
    pub const EOF_TEXT: &'static str = "EOF";

    pub fn from_text(text: &str) -> Self {
        if text == Self::EOF_TEXT {
            RemoteError::Eof
        } else {
            RemoteError::Message(text.to_string())
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Eof => f.write_str(Self::EOF_TEXT),
            RemoteError::Message(msg) => f.write_str(msg),
        }
    }
}

/// Type-specific frame payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    Data(Bytes),
    Connect { protocol: String, address: String },
    Error(RemoteError),
    AddClient(ClientKey),
    RemoveClient(ClientKey),
    Pause,
    Resume,
    SyncConnections(Vec<i64>),
}

/// A single tunnel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: i64,
    pub conn_id: i64,
    pub body: FrameBody,
}

impl Frame {
    pub fn new(conn_id: i64, body: FrameBody) -> Self {
        Self {
            id: next_frame_id(),
            conn_id,
            body,
        }
    }

    pub fn data(conn_id: i64, payload: Bytes) -> Self {
        Self::new(conn_id, FrameBody::Data(payload))
    }

    pub fn connect(conn_id: i64, protocol: impl Into<String>, address: impl Into<String>) -> Self {
        Self::new(
            conn_id,
            FrameBody::Connect {
                protocol: protocol.into(),
                address: address.into(),
            },
        )
    }

    pub fn error(conn_id: i64, err: RemoteError) -> Self {
        Self::new(conn_id, FrameBody::Error(err))
    }

    pub fn add_client(key: ClientKey) -> Self {
        Self::new(CONTROL_CONN_ID, FrameBody::AddClient(key))
    }

    pub fn remove_client(key: ClientKey) -> Self {
        Self::new(CONTROL_CONN_ID, FrameBody::RemoveClient(key))
    }

    pub fn pause(conn_id: i64) -> Self {
        Self::new(conn_id, FrameBody::Pause)
    }

    pub fn resume(conn_id: i64) -> Self {
        Self::new(conn_id, FrameBody::Resume)
    }

    pub fn sync_connections(conn_ids: Vec<i64>) -> Self {
        Self::new(CONTROL_CONN_ID, FrameBody::SyncConnections(conn_ids))
    }

    pub fn frame_type(&self) -> FrameType {
        match self.body {
            FrameBody::Data(_) => FrameType::Data,
            FrameBody::Connect { .. } => FrameType::Connect,
            FrameBody::Error(_) => FrameType::Error,
            FrameBody::AddClient(_) => FrameType::AddClient,
            FrameBody::RemoveClient(_) => FrameType::RemoveClient,
            FrameBody::Pause => FrameType::Pause,
            FrameBody::Resume => FrameType::Resume,
            FrameBody::SyncConnections(_) => FrameType::SyncConnections,
        }
    }

    /// Encode the frame into one transport message
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let frame_type = self.frame_type();
        let mut buf = BytesMut::with_capacity(4 * MAX_VARINT_LEN + self.payload_hint());

        put_varint(&mut buf, self.id);
        put_varint(&mut buf, self.conn_id);
        put_varint(&mut buf, frame_type as i64);
        if frame_type.has_legacy_field() {
            put_varint(&mut buf, LEGACY_DEADLINE_MILLIS);
        }

        match &self.body {
            FrameBody::Data(payload) => buf.put_slice(payload),
            FrameBody::Connect { protocol, address } => {
                let text = format!("{}/{}", protocol, address);
                put_control_text(&mut buf, &text)?;
            }
            FrameBody::Error(err) => {
                let text = err.to_string();
                buf.put_slice(truncate_utf8(&text, MAX_CONTROL_PAYLOAD).as_bytes());
            }
            FrameBody::AddClient(key) | FrameBody::RemoveClient(key) => {
                put_control_text(&mut buf, &key.to_string())?;
            }
            FrameBody::Pause | FrameBody::Resume => {}
            FrameBody::SyncConnections(conn_ids) => {
                for conn_id in conn_ids {
                    buf.put_u64_le(*conn_id as u64);
                }
            }
        }

        Ok(buf.freeze())
    }

    /// Decode one transport message into a frame
    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        let id = get_varint(&mut buf)?;
        let conn_id = get_varint(&mut buf)?;
        let frame_type = FrameType::try_from(get_varint(&mut buf)?)?;

        if frame_type.has_legacy_field() {
            let _ = get_varint(&mut buf)?;
        }

        let body = match frame_type {
            FrameType::Data => FrameBody::Data(buf),
            FrameType::Connect => {
                let text = control_text(&buf);
                let (protocol, address) = text
                    .split_once('/')
                    .ok_or_else(|| FrameError::InvalidConnect(text.to_string()))?;
                FrameBody::Connect {
                    protocol: protocol.to_string(),
                    address: address.to_string(),
                }
            }
            FrameType::Error => FrameBody::Error(RemoteError::from_text(&control_text(&buf))),
            FrameType::AddClient => FrameBody::AddClient(control_text(&buf).parse()?),
            FrameType::RemoveClient => FrameBody::RemoveClient(control_text(&buf).parse()?),
            FrameType::Pause => FrameBody::Pause,
            FrameType::Resume => FrameBody::Resume,
            FrameType::SyncConnections => {
                if buf.len() % 8 != 0 {
                    return Err(FrameError::MisalignedSync(buf.len()));
                }
                let mut conn_ids = Vec::with_capacity(buf.len() / 8);
                while buf.has_remaining() {
                    conn_ids.push(buf.get_u64_le() as i64);
                }
                FrameBody::SyncConnections(conn_ids)
            }
        };

        Ok(Self { id, conn_id, body })
    }

    fn payload_hint(&self) -> usize {
        match &self.body {
            FrameBody::Data(payload) => payload.len(),
            FrameBody::SyncConnections(conn_ids) => conn_ids.len() * 8,
            _ => MAX_CONTROL_PAYLOAD,
        }
    }
}

fn put_control_text(buf: &mut BytesMut, text: &str) -> Result<(), FrameError> {
    if text.len() > MAX_CONTROL_PAYLOAD {
        return Err(FrameError::PayloadTooLong(text.len()));
    }
    buf.put_slice(text.as_bytes());
    Ok(())
}

/// Only the first 100 bytes are read. A character cut by that cap is dropped;
/// other invalid bytes decode as U+FFFD.
fn control_text(buf: &[u8]) -> Cow<'_, str> {
    let mut limit = buf.len().min(MAX_CONTROL_PAYLOAD);
    if limit < buf.len() {
        if let Err(e) = std::str::from_utf8(&buf[..limit]) {
            if e.error_len().is_none() {
                limit = e.valid_up_to();
            }
        }
    }
    String::from_utf8_lossy(&buf[..limit])
}

fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
