//! A session: one transport carrying many virtual connections
//!
//! Exactly one task runs [`Session::serve`], dispatching inbound frames in
//! order. Any number of tasks may write; the transport writer serializes them.
//! Client-role sessions also run the ping and SyncConnections timers.

use revdial_proto::{ordered_difference, ClientKey, Frame, FrameBody, RemoteError};
use revdial_transport::{split, Transport, TransportReader, TransportWriter};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::conn::{TunnelAddr, VirtualConn};
use crate::error::{ConnError, SessionError};
use crate::pipe::{self, Dialer, NetDialer};

/// Decides whether an inbound Connect for `(network, address)` may be dialed
pub type ConnectAuthorizer = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Authorizer that accepts every Connect
pub fn allow_all() -> ConnectAuthorizer {
    Arc::new(|_: &str, _: &str| true)
}

/// Which side of the tunnel a session sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Dialed out to a server; answers Connect requests and runs keepalives
    Client,
    /// Accepted by a server; opens connections with [`Session::dial`]
    Server,
}

pub struct Session {
    session_key: i64,
    client_key: String,
    role: SessionRole,
    config: Arc<SessionConfig>,
    writer: Arc<TransportWriter>,
    reader: tokio::sync::Mutex<Option<TransportReader>>,
    conns: Mutex<HashMap<i64, Arc<VirtualConn>>>,
    next_conn_id: AtomicI64,
    /// Clients reachable through this session (peer sessions only)
    remote_clients: Option<Mutex<HashMap<String, HashSet<i64>>>>,
    auth: Option<ConnectAuthorizer>,
    dialer: Arc<dyn Dialer>,
    closed: AtomicBool,
    shutdown: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_key", &self.session_key)
            .field("client_key", &self.client_key)
            .field("role", &self.role)
            .field("peer", &self.is_peer())
            .field("connections", &self.connection_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Session {
    /// Client-role session. Inbound Connects are checked with `auth` and dialed
    /// with [`NetDialer`].
    pub fn new_client(
        transport: Transport,
        auth: ConnectAuthorizer,
        config: SessionConfig,
    ) -> Arc<Self> {
        Self::new_client_with_dialer(transport, auth, Arc::new(NetDialer), config)
    }

    pub fn new_client_with_dialer(
        transport: Transport,
        auth: ConnectAuthorizer,
        dialer: Arc<dyn Dialer>,
        config: SessionConfig,
    ) -> Arc<Self> {
        Self::build(
            0,
            String::new(),
            SessionRole::Client,
            transport,
            false,
            Some(auth),
            dialer,
            config,
        )
    }

    /// Server-role session for `client_key`. Peer sessions track which clients
    /// the other server can reach.
    pub fn new_server(
        session_key: i64,
        client_key: impl Into<String>,
        transport: Transport,
        peer: bool,
        config: SessionConfig,
    ) -> Arc<Self> {
        Self::build(
            session_key,
            client_key.into(),
            SessionRole::Server,
            transport,
            peer,
            None,
            Arc::new(NetDialer),
            config,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        session_key: i64,
        client_key: String,
        role: SessionRole,
        transport: Transport,
        peer: bool,
        auth: Option<ConnectAuthorizer>,
        dialer: Arc<dyn Dialer>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (writer, reader) = split(transport, config.read_timeout, config.control_timeout);
        Arc::new(Self {
            session_key,
            client_key,
            role,
            config: Arc::new(config),
            writer,
            reader: tokio::sync::Mutex::new(Some(reader)),
            conns: Mutex::new(HashMap::new()),
            next_conn_id: AtomicI64::new(0),
            remote_clients: peer.then(|| Mutex::new(HashMap::new())),
            auth,
            dialer,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn session_key(&self) -> i64 {
        self.session_key
    }

    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn is_peer(&self) -> bool {
        self.remote_clients.is_some()
    }

    pub fn config(&self) -> &Arc<SessionConfig> {
        &self.config
    }

    pub(crate) fn writer(&self) -> &Arc<TransportWriter> {
        &self.writer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the session has been closed
    pub async fn closed(&self) {
        loop {
            let shutdown = self.shutdown.notified();
            if self.is_closed() {
                return;
            }
            shutdown.await;
        }
    }

    /// Run the dispatch loop until the transport fails or the session is
    /// closed. The session is closed when this returns.
    pub async fn serve(self: &Arc<Self>) -> Result<(), SessionError> {
        let mut reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or(SessionError::AlreadyServing)?;

        if self.role == SessionRole::Client {
            self.start_keepalive();
        }

        debug!(
            session_key = self.session_key,
            client_key = %self.client_key,
            role = ?self.role,
            "Session serving"
        );

        let result = self.dispatch_loop(&mut reader).await;
        if let Err(e) = &result {
            debug!(
                session_key = self.session_key,
                client_key = %self.client_key,
                "Session ended: {}",
                e
            );
        }
        self.close().await;
        result
    }

    async fn dispatch_loop(self: &Arc<Self>, reader: &mut TransportReader) -> Result<(), SessionError> {
        loop {
            let shutdown = self.shutdown.notified();
            if self.is_closed() {
                return Ok(());
            }

            let message = tokio::select! {
                _ = shutdown => return Ok(()),
                message = reader.next_message() => message?,
            };

            let frame = Frame::decode(message)?;
            self.dispatch(frame).await;
        }
    }

    async fn dispatch(self: &Arc<Self>, frame: Frame) {
        if self.config.verbose {
            trace!(
                session_key = self.session_key,
                frame_id = frame.id,
                conn_id = frame.conn_id,
                frame_type = ?frame.frame_type(),
                "Received frame"
            );
        }

        let conn_id = frame.conn_id;
        match frame.body {
            FrameBody::Connect { protocol, address } => {
                self.client_connect(conn_id, TunnelAddr::new(protocol, address))
                    .await;
            }
            FrameBody::AddClient(key) => self.add_remote_client(key),
            FrameBody::RemoveClient(key) => self.remove_remote_client(key),
            FrameBody::SyncConnections(conn_ids) => self.close_stale(conn_ids),
            FrameBody::Data(payload) => match self.get_connection(conn_id) {
                Some(conn) => {
                    if let Err(err) = conn.on_data(&payload).await {
                        self.close_connection(conn_id, err).await;
                    }
                }
                None => {
                    let text = format!(
                        "connection not found {}/{}/{}",
                        self.client_key, self.session_key, conn_id
                    );
                    self.send_control(Frame::error(conn_id, RemoteError::Message(text)))
                        .await;
                }
            },
            FrameBody::Pause => {
                if let Some(conn) = self.get_connection(conn_id) {
                    conn.on_pause();
                }
            }
            FrameBody::Resume => {
                if let Some(conn) = self.get_connection(conn_id) {
                    conn.on_resume();
                }
            }
            FrameBody::Error(err) => {
                // The peer already forgot this id; close without echoing.
                if let Some(conn) = self.remove_connection(conn_id) {
                    conn.do_tunnel_close(ConnError::from_remote(err));
                }
            }
        }
    }

    async fn client_connect(self: &Arc<Self>, conn_id: i64, addr: TunnelAddr) {
        let allowed = self
            .auth
            .as_ref()
            .is_some_and(|auth| auth(addr.network(), addr.address()));

        if !allowed {
            warn!(
                session_key = self.session_key,
                conn_id = conn_id,
                network = %addr.network(),
                address = %addr.address(),
                "Connect not allowed"
            );
            self.send_control(Frame::error(
                conn_id,
                RemoteError::Message("connect not allowed".to_string()),
            ))
            .await;
            return;
        }

        let conn = VirtualConn::new(conn_id, self, addr);
        {
            let mut conns = lock(&self.conns);
            if self.is_closed() {
                return;
            }
            if let Some(previous) = conns.insert(conn_id, conn.clone()) {
                warn!(conn_id = conn_id, "Connect reused an active connection id");
                previous.do_tunnel_close(ConnError::ClosedPipe);
            }
        }

        tokio::spawn(pipe::dial_and_pipe(
            self.dialer.clone(),
            conn,
            self.config.dial_timeout,
        ));
    }

    /// Open a virtual connection to `address` on the other side of the tunnel.
    ///
    /// Returns once the Connect frame is written; a failed remote dial shows up
    /// as an error on the first read. If `timeout` (default
    /// `SessionConfig::dial_timeout`) passes first, the call fails and a
    /// connection that completes later is closed.
    pub async fn dial(
        self: &Arc<Self>,
        network: &str,
        address: &str,
        timeout: Option<Duration>,
    ) -> Result<Arc<VirtualConn>, SessionError> {
        let timeout = timeout.unwrap_or(self.config.dial_timeout);
        let session = self.clone();
        let (network, address) = (network.to_string(), address.to_string());
        let mut handle =
            tokio::spawn(async move { session.server_connect(&network, &address).await });

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(joined) => joined.map_err(|e| SessionError::DialTask(e.to_string()))?,
            Err(_) => {
                tokio::spawn(async move {
                    if let Ok(Ok(conn)) = handle.await {
                        conn.close().await;
                    }
                });
                Err(SessionError::DialTimeout(timeout))
            }
        }
    }

    async fn server_connect(
        self: &Arc<Self>,
        network: &str,
        address: &str,
    ) -> Result<Arc<VirtualConn>, SessionError> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst) + 1;
        let conn = VirtualConn::new(conn_id, self, TunnelAddr::new(network, address));
        {
            // close() sets the flag before draining this table.
            let mut conns = lock(&self.conns);
            if self.is_closed() {
                return Err(SessionError::Closed);
            }
            conns.insert(conn_id, conn.clone());
        }

        let deadline = Instant::now() + self.config.control_timeout;
        if let Err(e) = self
            .write_frame(Some(deadline), &Frame::connect(conn_id, network, address))
            .await
        {
            // The peer never learned this id.
            if let Some(conn) = self.remove_connection(conn_id) {
                conn.do_tunnel_close(ConnError::Io(e.to_string()));
            }
            return Err(e);
        }

        debug!(
            session_key = self.session_key,
            client_key = %self.client_key,
            conn_id = conn_id,
            network = %network,
            address = %address,
            "Opened tunnel connection"
        );
        Ok(conn)
    }

    /// Write one frame to the transport. `None` waits as long as the socket needs.
    pub async fn write_frame(&self, deadline: Option<Instant>, frame: &Frame) -> Result<(), SessionError> {
        let message = frame.encode()?;
        if self.config.verbose {
            trace!(
                session_key = self.session_key,
                frame_id = frame.id,
                conn_id = frame.conn_id,
                frame_type = ?frame.frame_type(),
                "Sending frame"
            );
        }
        self.writer.write_message(deadline, message).await?;
        Ok(())
    }

    /// Best-effort control frame, bounded by the control timeout
    async fn send_control(&self, frame: Frame) {
        let deadline = Instant::now() + self.config.control_timeout;
        if let Err(e) = self.write_frame(Some(deadline), &frame).await {
            debug!(
                session_key = self.session_key,
                conn_id = frame.conn_id,
                "Failed to send {:?} frame: {}",
                frame.frame_type(),
                e
            );
        }
    }

    /// Announce a client reachable through this server (AddClient)
    pub async fn announce_client(&self, key: ClientKey) -> Result<(), SessionError> {
        let deadline = Instant::now() + self.config.control_timeout;
        self.write_frame(Some(deadline), &Frame::add_client(key)).await
    }

    /// Withdraw a previously announced client (RemoveClient)
    pub async fn withdraw_client(&self, key: ClientKey) -> Result<(), SessionError> {
        let deadline = Instant::now() + self.config.control_timeout;
        self.write_frame(Some(deadline), &Frame::remove_client(key)).await
    }

    pub fn get_connection(&self, conn_id: i64) -> Option<Arc<VirtualConn>> {
        lock(&self.conns).get(&conn_id).cloned()
    }

    fn remove_connection(&self, conn_id: i64) -> Option<Arc<VirtualConn>> {
        lock(&self.conns).remove(&conn_id)
    }

    /// Remove a connection and report `err` to the peer, once
    pub async fn close_connection(&self, conn_id: i64, err: ConnError) {
        if let Some(conn) = self.remove_connection(conn_id) {
            conn.tunnel_close(err).await;
        }
    }

    /// Ids of every open connection, ascending
    pub fn active_conn_ids(&self) -> Vec<i64> {
        let mut conn_ids: Vec<i64> = lock(&self.conns).keys().copied().collect();
        conn_ids.sort_unstable();
        conn_ids
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.conns).len()
    }

    fn close_stale(&self, mut remote_ids: Vec<i64>) {
        remote_ids.sort_unstable();
        remote_ids.dedup();

        let now = Instant::now();
        let stale: Vec<Arc<VirtualConn>> = {
            let mut conns = lock(&self.conns);
            let mut local_ids: Vec<i64> = conns.keys().copied().collect();
            local_ids.sort_unstable();

            let mut stale = Vec::new();
            for conn_id in ordered_difference(&local_ids, &remote_ids) {
                // Too young: the peer may not have seen the Connect yet.
                let expired = conns.get(&conn_id).is_some_and(|conn| {
                    now.saturating_duration_since(conn.created_at()) >= self.config.stale_grace
                });
                if expired {
                    stale.extend(conns.remove(&conn_id));
                }
            }
            stale
        };

        if stale.is_empty() {
            return;
        }
        debug!(
            session_key = self.session_key,
            client_key = %self.client_key,
            count = stale.len(),
            "Closing stale connections"
        );
        for conn in stale {
            conn.do_tunnel_close(ConnError::Stale);
        }
    }

    fn add_remote_client(&self, key: ClientKey) {
        let Some(remote_clients) = &self.remote_clients else {
            debug!(session_key = self.session_key, "Ignoring AddClient on a non-peer session");
            return;
        };
        debug!(
            session_key = self.session_key,
            remote_client = %key,
            "Peer announced client"
        );
        lock(remote_clients)
            .entry(key.client_key)
            .or_default()
            .insert(key.session_key);
    }

    fn remove_remote_client(&self, key: ClientKey) {
        let Some(remote_clients) = &self.remote_clients else {
            return;
        };
        let mut remote_clients = lock(remote_clients);
        if let Some(session_keys) = remote_clients.get_mut(&key.client_key) {
            session_keys.remove(&key.session_key);
            if session_keys.is_empty() {
                remote_clients.remove(&key.client_key);
            }
        }
    }

    /// Whether the other server announced `client_key` (peer sessions only)
    pub fn has_remote_client(&self, client_key: &str) -> bool {
        self.remote_clients
            .as_ref()
            .is_some_and(|remote_clients| lock(remote_clients).contains_key(client_key))
    }

    /// Snapshot of the clients announced by the other server
    pub fn remote_clients(&self) -> HashMap<String, HashSet<i64>> {
        self.remote_clients
            .as_ref()
            .map(|remote_clients| lock(remote_clients).clone())
            .unwrap_or_default()
    }

    fn start_keepalive(self: &Arc<Self>) {
        let ping = tokio::spawn(ping_loop(Arc::downgrade(self), self.config.ping_interval));
        let sync = tokio::spawn(sync_loop(Arc::downgrade(self), self.config.sync_interval));
        lock(&self.tasks).extend([ping, sync]);
    }

    /// Close every connection with "tunnel disconnect", stop the timers and
    /// close the transport. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();

        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }

        let conns: Vec<Arc<VirtualConn>> = lock(&self.conns).drain().map(|(_, conn)| conn).collect();
        for conn in &conns {
            conn.do_tunnel_close(ConnError::TunnelDisconnect);
        }

        info!(
            session_key = self.session_key,
            client_key = %self.client_key,
            closed_connections = conns.len(),
            "Session closed"
        );

        match tokio::time::timeout(self.config.control_timeout, self.writer.close()).await {
            Ok(Err(e)) => debug!("Error closing transport: {}", e),
            Err(_) => debug!("Timed out closing transport"),
            Ok(Ok(())) => {}
        }
    }
}

async fn ping_loop(session: Weak<Session>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let Some(session) = session.upgrade() else {
            break;
        };
        if session.is_closed() {
            break;
        }
        let deadline = Instant::now() + session.config.control_timeout;
        if let Err(e) = session.writer.write_ping(deadline).await {
            warn!(session_key = session.session_key, "Failed to write ping: {}", e);
        }
    }
}

async fn sync_loop(session: Weak<Session>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let Some(session) = session.upgrade() else {
            break;
        };
        if session.is_closed() {
            break;
        }
        let conn_ids = session.active_conn_ids();
        let count = conn_ids.len();
        let deadline = Instant::now() + session.config.control_timeout;
        match session
            .write_frame(Some(deadline), &Frame::sync_connections(conn_ids))
            .await
        {
            Ok(()) => trace!(session_key = session.session_key, count = count, "Synced connections"),
            Err(e) => warn!(session_key = session.session_key, "Failed to sync connections: {}", e),
        }
    }
}
