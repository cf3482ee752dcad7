//! Outbound links to federated servers
//!
//! A peer link connects to another server as a peer and registers its session
//! as a listener on the local registry, so the other server learns every
//! client connected here. Connects arriving over the link name their target as
//! `"<clientKey>::<network>"`; the link dials that client through the local
//! registry and bridges the two connections.

use async_trait::async_trait;
use revdial_connection::{pipe, ConnectAuthorizer, Dialer, NetStream, Session, SessionConfig};
use revdial_control::{
    SessionRegistry, PEER_ROUTE_SEPARATOR, TUNNEL_ID_HEADER, TUNNEL_PEER_HEADER,
    TUNNEL_TOKEN_HEADER,
};
use revdial_transport_websocket::{HeaderMap, HeaderValue};
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connector::Connector;
use crate::error::ConnectError;
use crate::reconnect::ReconnectConfig;

const BRIDGE_BUFFER: usize = 64 * 1024;

/// Only routed Connects are accepted over a peer link
pub fn peer_authorizer() -> ConnectAuthorizer {
    Arc::new(|network: &str, _: &str| network.contains(PEER_ROUTE_SEPARATOR))
}

/// Dials `"<clientKey>::<network>"` through the clients connected here
pub struct RoutingDialer {
    registry: Arc<SessionRegistry>,
}

impl RoutingDialer {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Dialer for RoutingDialer {
    async fn dial(&self, network: &str, address: &str) -> io::Result<Box<dyn NetStream>> {
        let (client_key, network) = network.split_once(PEER_ROUTE_SEPARATOR).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("missing client key in network {:?}", network),
            )
        })?;

        let target = self
            .registry
            .dialer(client_key)
            .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e.to_string()))?;
        // Never hop through a second peer.
        if target.is_routed() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("failed to find Session for client {}", client_key),
            ));
        }

        let conn = target
            .dial(network, address, None)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;

        debug!(
            client_key = %client_key,
            conn_id = conn.conn_id(),
            "Bridging peer connection to {}/{}",
            network,
            address
        );

        let (near, far) = tokio::io::duplex(BRIDGE_BUFFER);
        tokio::spawn(pipe(conn, far));
        Ok(Box::new(near))
    }
}

/// Removes the link from the registry's listeners when the session ends
struct ListenerGuard {
    registry: Arc<SessionRegistry>,
    session: Arc<Session>,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.registry.remove_listener(&self.session);
    }
}

/// Keeps this server federated with one other server
pub struct PeerLink {
    url: String,
    server_id: String,
    token: Option<String>,
    registry: Arc<SessionRegistry>,
    session_config: SessionConfig,
    reconnect: ReconnectConfig,
}

impl PeerLink {
    /// Link to the server at `url`, introducing this server as `server_id`
    pub fn new(
        url: impl Into<String>,
        server_id: impl Into<String>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            url: url.into(),
            server_id: server_id.into(),
            token: None,
            registry,
            session_config: SessionConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    fn headers(&self) -> Result<HeaderMap, ConnectError> {
        let value = |v: &str| {
            HeaderValue::from_str(v)
                .map_err(|e| ConnectError::InvalidHeader(e.to_string()))
        };

        let mut headers = HeaderMap::new();
        headers.insert(TUNNEL_ID_HEADER, value(&self.server_id)?);
        headers.insert(TUNNEL_PEER_HEADER, HeaderValue::from_static("true"));
        if let Some(token) = &self.token {
            headers.insert(TUNNEL_TOKEN_HEADER, value(token)?);
        }
        Ok(headers)
    }

    /// Connector that serves the link: routed dialing, and registration as
    /// a registry listener for as long as each session lives
    pub fn connector(&self) -> Result<Connector, ConnectError> {
        let registry = self.registry.clone();
        let connector = Connector::new(self.url.clone(), self.headers()?, peer_authorizer())
            .with_dialer(Arc::new(RoutingDialer::new(self.registry.clone())))
            .with_session_config(self.session_config.clone())
            .with_reconnect(self.reconnect.clone())
            .on_connect(move |session| {
                let registry = registry.clone();
                async move {
                    let _guard = ListenerGuard {
                        registry: registry.clone(),
                        session: session.clone(),
                    };
                    registry.add_listener(session.clone()).await;
                    info!("Peer link established");
                    session.closed().await;
                    Ok(())
                }
            });
        Ok(connector)
    }

    /// Keep the link up until `cancel` fires
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), ConnectError> {
        info!("Linking to peer server {}", self.url);
        self.connector()?.connect_forever(cancel).await
    }
}
