//! Sessions and virtual connections over a message transport
//!
//! A [`Session`] owns one transport and multiplexes any number of
//! [`VirtualConn`]s over it. Each connection has its own inbound buffer with
//! Pause/Resume backpressure, so a slow reader stalls only its own sender.
//!
//! Server-role sessions open connections with [`Session::dial`]; client-role
//! sessions answer Connect frames by dialing the requested address locally
//! and piping bytes until either side closes.

pub mod config;
pub mod conn;
pub mod error;
pub mod flow;
pub mod pipe;
pub mod session;

pub use config::SessionConfig;
pub use conn::{TunnelAddr, VirtualConn};
pub use error::{ConnError, SessionError};
pub use pipe::{pipe, Dialer, NetDialer, NetStream};
pub use session::{allow_all, ConnectAuthorizer, Session, SessionRole};
