//! Dial a tunnel server and serve the resulting session
//!
//! One attempt dials the WebSocket, builds a client-role session and runs
//! its dispatch loop next to the optional `on_connect` callback. The attempt
//! ends when the session fails, the callback fails, or the caller cancels.

use futures_util::future::BoxFuture;
use revdial_connection::{ConnectAuthorizer, Dialer, NetDialer, Session, SessionConfig};
use revdial_transport_websocket::HeaderMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ConnectError;
use crate::reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};

/// Runs alongside a freshly connected session
pub type OnConnect =
    Arc<dyn Fn(Arc<Session>) -> BoxFuture<'static, Result<(), ConnectError>> + Send + Sync>;

#[derive(Clone)]
pub struct Connector {
    url: String,
    headers: HeaderMap,
    auth: ConnectAuthorizer,
    dialer: Arc<dyn Dialer>,
    session_config: SessionConfig,
    reconnect: ReconnectConfig,
    on_connect: Option<OnConnect>,
}

impl Connector {
    /// Connect to `url` (`ws://` or `wss://`) sending `headers`. Inbound
    /// Connects are checked with `auth` and dialed on the local network.
    pub fn new(url: impl Into<String>, headers: HeaderMap, auth: ConnectAuthorizer) -> Self {
        Self {
            url: url.into(),
            headers,
            auth,
            dialer: Arc::new(NetDialer),
            session_config: SessionConfig::default(),
            reconnect: ReconnectConfig::default(),
            on_connect: None,
        }
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
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

    /// Run `callback` with each new session. An error ends the attempt;
    /// `Ok` leaves the session serving.
    pub fn on_connect<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ConnectError>> + Send + 'static,
    {
        self.on_connect = Some(Arc::new(move |session| Box::pin(callback(session))));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One connection attempt. Failures other than cancellation wait out the
    /// first retry delay before returning, so callers can simply loop.
    pub async fn client_connect(&self, cancel: &CancellationToken) -> Result<(), ConnectError> {
        let mut backoff = ReconnectManager::new(self.reconnect.clone());
        let result = self.run_session(cancel, &mut backoff).await;

        if let Err(e) = &result {
            if !e.is_cancelled() {
                warn!("Tunnel connection to {} failed: {}", self.url, e);
                let _ = backoff.wait_or_cancel(cancel).await;
            }
        }
        result
    }

    /// Reconnect until `cancel` fires or the retry policy gives up
    pub async fn connect_forever(&self, cancel: &CancellationToken) -> Result<(), ConnectError> {
        let mut backoff = ReconnectManager::new(self.reconnect.clone());

        loop {
            match self.run_session(cancel, &mut backoff).await {
                Ok(()) => info!("Tunnel session to {} ended", self.url),
                Err(e) if e.is_cancelled() => return Ok(()),
                Err(e) => warn!("Tunnel connection to {} failed: {}", self.url, e),
            }

            match backoff.wait_or_cancel(cancel).await {
                Ok(()) => info!("Reconnecting to {}", self.url),
                Err(ReconnectError::Cancelled) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn run_session(
        &self,
        cancel: &CancellationToken,
        backoff: &mut ReconnectManager,
    ) -> Result<(), ConnectError> {
        let transport = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
            transport = revdial_transport_websocket::connect(&self.url, self.headers.clone()) => transport?,
        };

        info!("Connected to {}", self.url);
        backoff.reset();

        let session = Session::new_client_with_dialer(
            transport,
            self.auth.clone(),
            self.dialer.clone(),
            self.session_config.clone(),
        );

        let callback = async {
            if let Some(on_connect) = &self.on_connect {
                on_connect(session.clone()).await?;
                debug!("on_connect finished for {}", self.url);
            }
            std::future::pending::<Result<(), ConnectError>>().await
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConnectError::Cancelled),
            served = session.serve() => served.map_err(ConnectError::from),
            called = callback => called,
        };

        session.close().await;
        result
    }
}
