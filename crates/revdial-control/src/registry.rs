//! Session registry for connected clients and federated peers
//!
//! Every client that connects to this server gets a server-role session,
//! stored under its client key. Other servers connect as peers; their
//! sessions learn which clients the other server can reach. Outbound peer
//! links register as listeners and are told about every client added or
//! removed here.

use revdial_connection::{Session, SessionConfig, SessionError, VirtualConn};
use revdial_proto::ClientKey;
use revdial_transport::Transport;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;

/// Separates the target client key from the protocol in a routed Connect
pub const PEER_ROUTE_SEPARATOR: &str = "::";

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to find Session for client {0}")]
    NotFound(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Opens connections to one client, directly or through a peer server
#[derive(Debug, Clone)]
pub struct SessionDialer {
    session: Arc<Session>,
    route: Option<String>,
}

impl SessionDialer {
    /// Dial `address` on the client. Routed dialers prefix the network with
    /// `"<clientKey>::"` so the peer server can pick the right client.
    pub async fn dial(
        &self,
        network: &str,
        address: &str,
        timeout: Option<Duration>,
    ) -> Result<Arc<VirtualConn>, SessionError> {
        match &self.route {
            Some(client_key) => {
                let network = format!("{}{}{}", client_key, PEER_ROUTE_SEPARATOR, network);
                self.session.dial(&network, address, timeout).await
            }
            None => self.session.dial(network, address, timeout).await,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Whether connections go through a peer server
    pub fn is_routed(&self) -> bool {
        self.route.is_some()
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    clients: HashMap<String, Vec<Arc<Session>>>,
    peers: HashMap<String, Vec<Arc<Session>>>,
    listeners: Vec<Arc<Session>>,
}

/// Registry of live sessions
#[derive(Debug)]
pub struct SessionRegistry {
    state: RwLock<RegistryState>,
    config: SessionConfig,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

fn new_session_key() -> i64 {
    (uuid::Uuid::new_v4().as_u64_pair().0 >> 1) as i64
}

fn remove_session(
    table: &mut HashMap<String, Vec<Arc<Session>>>,
    session: &Arc<Session>,
) -> bool {
    let key = session.client_key();
    let Some(sessions) = table.get_mut(key) else {
        return false;
    };
    let before = sessions.len();
    sessions.retain(|s| !Arc::ptr_eq(s, session));
    let removed = sessions.len() != before;
    if sessions.is_empty() {
        table.remove(key);
    }
    removed
}

impl SessionRegistry {
    /// Create an empty registry. New sessions use `config`.
    pub fn new(config: SessionConfig) -> Self {
        tracing::info!("Creating new session registry");
        Self {
            state: RwLock::new(RegistryState::default()),
            config,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build a server-role session for `client_key` over `transport` and
    /// register it. The caller runs [`Session::serve`] and calls
    /// [`SessionRegistry::remove`] when it returns.
    pub async fn add(&self, client_key: &str, transport: Transport, peer: bool) -> Arc<Session> {
        let session = Session::new_server(
            new_session_key(),
            client_key,
            transport,
            peer,
            self.config.clone(),
        );

        let listeners = {
            let mut state = self.write();
            let table = if peer {
                &mut state.peers
            } else {
                &mut state.clients
            };
            table
                .entry(client_key.to_string())
                .or_default()
                .push(session.clone());
            state.listeners.clone()
        };

        tracing::info!(
            client_key = %client_key,
            session_key = session.session_key(),
            peer = peer,
            "Registered session"
        );

        if !peer {
            let key = ClientKey::new(client_key, session.session_key());
            for listener in listeners {
                if let Err(e) = listener.announce_client(key.clone()).await {
                    tracing::warn!(client = %key, "Failed to announce client to peer: {}", e);
                }
            }
        }

        session
    }

    /// Unregister and close a session. Unknown sessions are only closed.
    pub async fn remove(&self, session: &Arc<Session>) {
        let (was_client, listeners) = {
            let mut state = self.write();
            let was_client = remove_session(&mut state.clients, session);
            let was_peer = remove_session(&mut state.peers, session);
            if !was_client && !was_peer {
                tracing::warn!(
                    client_key = %session.client_key(),
                    session_key = session.session_key(),
                    "Attempted to remove unknown session"
                );
            }
            state.listeners.retain(|l| !Arc::ptr_eq(l, session));
            (was_client, state.listeners.clone())
        };

        if was_client {
            let key = ClientKey::new(session.client_key(), session.session_key());
            for listener in listeners {
                if let Err(e) = listener.withdraw_client(key.clone()).await {
                    tracing::warn!(client = %key, "Failed to withdraw client from peer: {}", e);
                }
            }
        }

        tracing::info!(
            client_key = %session.client_key(),
            session_key = session.session_key(),
            "Unregistered session"
        );
        session.close().await;
    }

    /// Register a listener and replay every registered client to it
    pub async fn add_listener(&self, listener: Arc<Session>) {
        let clients: Vec<ClientKey> = {
            let mut state = self.write();
            if !state.listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
                state.listeners.push(listener.clone());
            }
            state
                .clients
                .iter()
                .flat_map(|(key, sessions)| {
                    sessions
                        .iter()
                        .map(move |s| ClientKey::new(key.clone(), s.session_key()))
                })
                .collect()
        };

        tracing::debug!(clients = clients.len(), "Added peer listener");
        for key in clients {
            if let Err(e) = listener.announce_client(key.clone()).await {
                tracing::warn!(client = %key, "Failed to announce client to peer: {}", e);
                break;
            }
        }
    }

    pub fn remove_listener(&self, listener: &Arc<Session>) {
        self.write().listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Resolve how to reach `client_key`: a direct session first, then any
    /// peer session that announced it.
    pub fn dialer(&self, client_key: &str) -> Result<SessionDialer, RegistryError> {
        let state = self.read();

        if let Some(session) = state.clients.get(client_key).and_then(|s| s.first()) {
            return Ok(SessionDialer {
                session: session.clone(),
                route: None,
            });
        }

        for sessions in state.peers.values() {
            for session in sessions {
                if session.has_remote_client(client_key) {
                    return Ok(SessionDialer {
                        session: session.clone(),
                        route: Some(client_key.to_string()),
                    });
                }
            }
        }

        Err(RegistryError::NotFound(client_key.to_string()))
    }

    /// Whether `client_key` has a direct session here
    pub fn has_session(&self, client_key: &str) -> bool {
        self.read().clients.contains_key(client_key)
    }

    /// Keys of directly connected clients, sorted
    pub fn client_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read().clients.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Keys of connected peer servers, sorted
    pub fn peer_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read().peers.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn session_count(&self) -> usize {
        let state = self.read();
        state.clients.values().map(Vec::len).sum::<usize>()
            + state.peers.values().map(Vec::len).sum::<usize>()
    }

    pub fn listener_count(&self) -> usize {
        self.read().listeners.len()
    }
}
