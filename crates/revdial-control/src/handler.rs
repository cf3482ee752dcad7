//! HTTP endpoint that accepts tunnel clients and peer servers

use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use revdial_connection::SessionError;
use revdial_transport::Transport;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::registry::SessionRegistry;
use crate::websocket::axum_transport;

/// Path the tunnel endpoint is mounted on
pub const CONNECT_PATH: &str = "/connect";

/// Client key of the connecting tunnel
pub const TUNNEL_ID_HEADER: &str = "x-tunnel-id";
/// Set to `true` by federated peer servers
pub const TUNNEL_PEER_HEADER: &str = "x-tunnel-peer";
/// Shared secret
pub const TUNNEL_TOKEN_HEADER: &str = "x-tunnel-token";

/// Who is on the other end of an upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelIdentity {
    pub client_key: String,
    pub peer: bool,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("invalid tunnel token")]
    InvalidToken,

    #[error("{0}")]
    Rejected(String),
}

/// Resolves the identity of a tunnel from its upgrade request headers
pub trait Authorizer: Send + Sync {
    fn authorize(&self, headers: &HeaderMap) -> Result<TunnelIdentity, AuthError>;
}

/// Reads the `X-Tunnel-*` headers and checks an optional shared token
#[derive(Debug, Clone, Default)]
pub struct HeaderAuthorizer {
    token: Option<String>,
}

impl HeaderAuthorizer {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

impl Authorizer for HeaderAuthorizer {
    fn authorize(&self, headers: &HeaderMap) -> Result<TunnelIdentity, AuthError> {
        let header = |name: &'static str| headers.get(name).and_then(|v| v.to_str().ok());

        if let Some(expected) = &self.token {
            if header(TUNNEL_TOKEN_HEADER) != Some(expected.as_str()) {
                return Err(AuthError::InvalidToken);
            }
        }

        let client_key = header(TUNNEL_ID_HEADER)
            .filter(|id| !id.is_empty())
            .ok_or(AuthError::MissingHeader(TUNNEL_ID_HEADER))?;

        let peer = header(TUNNEL_PEER_HEADER).is_some_and(|v| v.eq_ignore_ascii_case("true"));

        Ok(TunnelIdentity {
            client_key: client_key.to_string(),
            peer,
        })
    }
}

/// Accepts tunnels over WebSocket and keeps them in a [`SessionRegistry`]
#[derive(Clone)]
pub struct TunnelServer {
    registry: Arc<SessionRegistry>,
    authorizer: Arc<dyn Authorizer>,
}

impl TunnelServer {
    pub fn new(registry: Arc<SessionRegistry>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            registry,
            authorizer,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Router with the tunnel endpoint at [`CONNECT_PATH`]
    pub fn router(&self) -> Router {
        Router::new()
            .route(CONNECT_PATH, get(connect_handler))
            .with_state(self.clone())
    }

    /// Register a session for an authorized transport, serve it until it
    /// ends, then unregister it.
    pub async fn serve_transport(
        &self,
        identity: TunnelIdentity,
        transport: Transport,
    ) -> Result<(), SessionError> {
        let session = self
            .registry
            .add(&identity.client_key, transport, identity.peer)
            .await;

        let result = session.serve().await;
        match &result {
            Ok(()) => info!(client_key = %identity.client_key, "Tunnel closed"),
            Err(e) => info!(client_key = %identity.client_key, "Tunnel disconnected: {}", e),
        }

        self.registry.remove(&session).await;
        result
    }
}

async fn connect_handler(
    State(server): State<TunnelServer>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = match server.authorizer.authorize(&headers) {
        Ok(identity) => identity,
        Err(e) => {
            warn!("Rejected tunnel: {}", e);
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };

    info!(
        client_key = %identity.client_key,
        peer = identity.peer,
        "Accepted tunnel"
    );

    ws.on_upgrade(move |socket| async move {
        let client_key = identity.client_key.clone();
        if let Err(e) = server
            .serve_transport(identity, axum_transport(socket))
            .await
        {
            debug!(client_key = %client_key, "Tunnel session ended with error: {}", e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_static(value));
        }
        headers
    }

    #[test]
    fn test_client_identity() {
        let auth = HeaderAuthorizer::default();
        let identity = auth
            .authorize(&headers(&[(TUNNEL_ID_HEADER, "cluster-a")]))
            .unwrap();
        assert_eq!(
            identity,
            TunnelIdentity {
                client_key: "cluster-a".into(),
                peer: false
            }
        );
    }

    #[test]
    fn test_peer_identity() {
        let auth = HeaderAuthorizer::default();
        let identity = auth
            .authorize(&headers(&[
                (TUNNEL_ID_HEADER, "server-b"),
                (TUNNEL_PEER_HEADER, "TRUE"),
            ]))
            .unwrap();
        assert!(identity.peer);
    }

    #[test]
    fn test_missing_id() {
        let auth = HeaderAuthorizer::default();
        assert!(matches!(
            auth.authorize(&HeaderMap::new()),
            Err(AuthError::MissingHeader(TUNNEL_ID_HEADER))
        ));
        assert!(auth
            .authorize(&headers(&[(TUNNEL_ID_HEADER, "")]))
            .is_err());
    }

    #[test]
    fn test_token_checked() {
        let auth = HeaderAuthorizer::new(Some("s3cret".into()));
        assert!(matches!(
            auth.authorize(&headers(&[(TUNNEL_ID_HEADER, "cluster-a")])),
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(
            auth.authorize(&headers(&[
                (TUNNEL_ID_HEADER, "cluster-a"),
                (TUNNEL_TOKEN_HEADER, "wrong")
            ])),
            Err(AuthError::InvalidToken)
        ));
        assert!(auth
            .authorize(&headers(&[
                (TUNNEL_ID_HEADER, "cluster-a"),
                (TUNNEL_TOKEN_HEADER, "s3cret")
            ]))
            .is_ok());
    }
}
