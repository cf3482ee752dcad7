//! TCP port forwarding through a tunnel
//!
//! Every TCP connection accepted on the local listener is dialed through the
//! registry to `network/address` on the target client and piped both ways.

use revdial_connection::pipe;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::registry::SessionRegistry;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}")]
    BindError { address: SocketAddr, reason: String },

    #[error("invalid forward target {0:?}, expected clientKey/network/address")]
    InvalidTarget(String),
}

/// Where forwarded connections go: `clientKey/network/address`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub client_key: String,
    pub network: String,
    pub address: String,
}

impl FromStr for ForwardTarget {
    type Err = ForwardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The address may itself contain '/' (unix sockets).
        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(client_key), Some(network), Some(address))
                if !client_key.is_empty() && !network.is_empty() && !address.is_empty() =>
            {
                Ok(Self {
                    client_key: client_key.to_string(),
                    network: network.to_string(),
                    address: address.to_string(),
                })
            }
            _ => Err(ForwardError::InvalidTarget(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForwardConfig {
    pub bind_addr: SocketAddr,
    pub target: ForwardTarget,
    pub dial_timeout: Option<Duration>,
}

/// Local TCP listener that forwards into a tunnel
pub struct ForwardServer {
    config: ForwardConfig,
    registry: Arc<SessionRegistry>,
}

impl ForwardServer {
    pub fn new(config: ForwardConfig, registry: Arc<SessionRegistry>) -> Self {
        Self { config, registry }
    }

    /// Bind the configured address and forward until accept fails
    pub async fn start(&self) -> Result<(), ForwardError> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| ForwardError::BindError {
                address: self.config.bind_addr,
                reason: e.to_string(),
            })?;
        self.serve(listener).await
    }

    /// Forward connections accepted on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ForwardError> {
        let target = &self.config.target;
        info!(
            "Forwarding {} to {}/{}/{}",
            listener.local_addr()?,
            target.client_key,
            target.network,
            target.address
        );

        loop {
            let (socket, peer_addr) = listener.accept().await?;
            debug!("Accepted forward connection from {}", peer_addr);

            let registry = self.registry.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                forward_connection(socket, peer_addr, registry, config).await;
            });
        }
    }
}

async fn forward_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    config: ForwardConfig,
) {
    let target = &config.target;
    let dialer = match registry.dialer(&target.client_key) {
        Ok(dialer) => dialer,
        Err(e) => {
            warn!("Dropping connection from {}: {}", peer_addr, e);
            return;
        }
    };

    let conn = match dialer
        .dial(&target.network, &target.address, config.dial_timeout)
        .await
    {
        Ok(conn) => conn,
        Err(e) => {
            error!(
                client_key = %target.client_key,
                "Failed to dial {} for {}: {}", target.address, peer_addr, e
            );
            return;
        }
    };

    let _ = socket.set_nodelay(true);
    pipe(conn, socket).await;
    debug!("Forward connection from {} finished", peer_addr);
}
