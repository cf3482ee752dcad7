//! Reverse dialer wire protocol
//!
//! This crate defines the binary frame format exchanged between the two ends
//! of a multiplexed tunnel, along with the helpers used to reconcile
//! connection tables after a reconnect.

pub mod diff;
pub mod frame;
pub mod varint;

pub use diff::ordered_difference;
pub use frame::{ClientKey, Frame, FrameBody, FrameError, FrameType, RemoteError};

/// Reserved connection ID for session-global control frames
pub const CONTROL_CONN_ID: i64 = 0;

/// Maximum number of payload bytes read for Connect, Error, AddClient and RemoveClient frames
pub const MAX_CONTROL_PAYLOAD: usize = 100;

/// Value written in the legacy header field of Data and Connect frames.
///
/// Decoders skip the field. It is kept so older peers can parse our frames.
pub const LEGACY_DEADLINE_MILLIS: i64 = 15_000;
