//! Server side of the tunnel
//!
//! [`TunnelServer`] upgrades `/connect` requests to WebSocket sessions and
//! keeps them in a [`SessionRegistry`]. The registry resolves a client key to
//! a session (directly, or through a federated peer server) that can dial
//! into the client's network.

pub mod forward;
pub mod handler;
pub mod registry;
pub mod websocket;

pub use forward::{ForwardConfig, ForwardError, ForwardServer, ForwardTarget};
pub use handler::{
    AuthError, Authorizer, HeaderAuthorizer, TunnelIdentity, TunnelServer, CONNECT_PATH,
    TUNNEL_ID_HEADER, TUNNEL_PEER_HEADER, TUNNEL_TOKEN_HEADER,
};
pub use registry::{RegistryError, SessionDialer, SessionRegistry, PEER_ROUTE_SEPARATOR};
pub use websocket::axum_transport;
