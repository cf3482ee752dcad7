//! Client side of the tunnel
//!
//! A [`Connector`] dials a tunnel server over WebSocket and serves the
//! resulting session, so the server can open connections into this network.
//! [`PeerLink`] uses the same machinery to federate two servers.

pub mod auth;
pub mod connector;
pub mod error;
pub mod peer;
pub mod reconnect;

pub use auth::AllowList;
pub use connector::{Connector, OnConnect};
pub use error::ConnectError;
pub use peer::{peer_authorizer, PeerLink, RoutingDialer};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager, DEFAULT_RETRY_DELAY};
pub use tokio_util::sync::CancellationToken;
