//! Virtual connections multiplexed over a session

use bytes::Bytes;
use revdial_proto::Frame;
use revdial_transport::{TransportError, TransportWriter};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::config::SessionConfig;
use crate::error::ConnError;
use crate::flow::{FlowControl, FlowSignal};
use crate::session::Session;

/// Network and address a virtual connection was opened for.
///
/// Used as both the local and the remote address of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelAddr {
    network: String,
    address: String,
}

impl TunnelAddr {
    pub fn new(network: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            address: address.into(),
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for TunnelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// One logical byte stream inside a session
pub struct VirtualConn {
    conn_id: i64,
    session_key: i64,
    addr: TunnelAddr,
    session: Weak<Session>,
    writer: Arc<TransportWriter>,
    config: Arc<SessionConfig>,
    flow: FlowControl,
    /// Serializes watermark evaluation with the Pause/Resume send
    signal_lock: tokio::sync::Mutex<()>,
    write_deadline: Mutex<Option<Instant>>,
    created_at: Instant,
}

impl fmt::Debug for VirtualConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualConn")
            .field("conn_id", &self.conn_id)
            .field("session_key", &self.session_key)
            .field("addr", &self.addr)
            .field("buffered", &self.flow.buffered())
            .field("closed", &self.flow.is_closed())
            .finish()
    }
}

impl VirtualConn {
    pub(crate) fn new(conn_id: i64, session: &Arc<Session>, addr: TunnelAddr) -> Arc<Self> {
        let config = session.config().clone();
        Arc::new(Self {
            conn_id,
            session_key: session.session_key(),
            addr,
            session: Arc::downgrade(session),
            writer: session.writer().clone(),
            flow: FlowControl::new(config.max_buffer),
            config,
            signal_lock: tokio::sync::Mutex::new(()),
            write_deadline: Mutex::new(None),
            created_at: Instant::now(),
        })
    }

    pub fn conn_id(&self) -> i64 {
        self.conn_id
    }

    pub fn local_addr(&self) -> &TunnelAddr {
        &self.addr
    }

    pub fn remote_addr(&self) -> &TunnelAddr {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.flow.is_closed()
    }

    /// Error the connection was closed with, if any
    pub fn terminal_error(&self) -> Option<ConnError> {
        self.flow.terminal_error()
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Read into `buf`. Returns `Ok(0)` once the peer has closed cleanly and
    /// everything buffered has been read.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ConnError> {
        let chunk = self.read_chunk(buf.len()).await?;
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    /// Take up to `max` buffered bytes. An empty chunk means clean EOF.
    pub async fn read_chunk(&self, max: usize) -> Result<Bytes, ConnError> {
        if max == 0 {
            return Ok(Bytes::new());
        }
        let result = self.flow.read_chunk(max).await;
        self.apply_watermarks().await;
        match result {
            Err(ConnError::Eof) => Ok(Bytes::new()),
            other => other,
        }
    }

    /// Send `data` as one Data frame.
    ///
    /// Blocks while the peer has paused this connection. If the write
    /// deadline passes while blocked or while sending, the connection is
    /// closed with [`ConnError::WriteTimeout`].
    pub async fn write(&self, data: &[u8]) -> Result<usize, ConnError> {
        if self.flow.is_closed() {
            return Err(ConnError::ClosedPipe);
        }

        let deadline = self.write_deadline();
        let conn_id = self.conn_id;
        let verbose = self.config.verbose;
        let wait = self.flow.wait(|| {
            if verbose {
                trace!(conn_id = conn_id, "Writer woken, peer still paused");
            }
        });

        match deadline {
            Some(deadline) => {
                if timeout_at(deadline, wait).await.is_err() {
                    debug!(
                        session_key = self.session_key,
                        conn_id = conn_id,
                        "Write deadline passed while paused by peer"
                    );
                    self.close_with(ConnError::WriteTimeout).await;
                    return Err(ConnError::WriteTimeout);
                }
            }
            None => wait.await,
        }

        if self.flow.is_closed() {
            return Err(ConnError::ClosedPipe);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let frame = Frame::data(conn_id, Bytes::copy_from_slice(data));
        if let Err(err) = self.send_frame(deadline, &frame).await {
            if err == ConnError::WriteTimeout {
                debug!(
                    session_key = self.session_key,
                    conn_id = conn_id,
                    "Write deadline passed while sending"
                );
                self.close_with(ConnError::WriteTimeout).await;
            }
            return Err(err);
        }
        Ok(data.len())
    }

    /// Write all of `data`
    pub async fn write_all(&self, data: &[u8]) -> Result<(), ConnError> {
        self.write(data).await.map(|_| ())
    }

    /// Close locally and tell the peer with an `EOF` error frame
    pub async fn close(&self) {
        self.close_with(ConnError::Eof).await;
    }

    /// Close locally with `err`, reporting it to the peer if the connection
    /// is still registered with its session.
    pub async fn close_with(&self, err: ConnError) {
        match self.session.upgrade() {
            Some(session) => session.close_connection(self.conn_id, err).await,
            None => {
                self.do_tunnel_close(err);
            }
        }
        self.flow.close_backpressure();
    }

    /// Deadline for reads; `None` blocks indefinitely
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.flow.set_read_deadline(deadline);
    }

    /// Deadline for writes, also bounding the wait on a paused peer
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.write_deadline.lock().unwrap_or_else(|e| e.into_inner()) = deadline;
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    fn write_deadline(&self) -> Option<Instant> {
        *self.write_deadline.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bytes buffered and not yet read
    pub fn buffered(&self) -> usize {
        self.flow.buffered()
    }

    /// Whether this side has asked the peer to pause
    pub fn is_paused(&self) -> bool {
        self.flow.is_paused()
    }

    /// Whether the peer has asked this side to pause
    pub fn is_remote_paused(&self) -> bool {
        self.flow.is_remote_paused()
    }

    pub(crate) async fn on_data(&self, data: &[u8]) -> Result<(), ConnError> {
        self.flow.offer(data)?;
        self.apply_watermarks().await;
        Ok(())
    }

    pub(crate) fn on_pause(&self) {
        self.flow.on_pause();
    }

    pub(crate) fn on_resume(&self) {
        self.flow.on_resume();
    }

    /// Report `err` to the peer and close locally, once.
    pub(crate) async fn tunnel_close(&self, err: ConnError) {
        let remote = err.to_remote();
        if !self.do_tunnel_close(err) {
            return;
        }
        let deadline = Instant::now() + self.config.control_timeout;
        if let Err(e) = self
            .send_frame(Some(deadline), &Frame::error(self.conn_id, remote))
            .await
        {
            debug!(
                session_key = self.session_key,
                conn_id = self.conn_id,
                "Failed to send error frame: {}",
                e
            );
        }
    }

    /// Close locally without telling the peer. The first error wins.
    pub(crate) fn do_tunnel_close(&self, err: ConnError) -> bool {
        self.flow.close(err)
    }

    async fn apply_watermarks(&self) {
        let _guard = self.signal_lock.lock().await;
        let Some(signal) = self.flow.watermark_signal() else {
            return;
        };

        let frame = match signal {
            FlowSignal::Pause => Frame::pause(self.conn_id),
            FlowSignal::Resume => Frame::resume(self.conn_id),
        };
        debug!(
            session_key = self.session_key,
            conn_id = self.conn_id,
            signal = ?signal,
            buffered = self.flow.buffered(),
            "Backpressure"
        );

        let deadline = Instant::now() + self.config.control_timeout;
        if let Err(e) = self.send_frame(Some(deadline), &frame).await {
            debug!(conn_id = self.conn_id, "Failed to send {:?}: {}", signal, e);
        }
    }

    async fn send_frame(&self, deadline: Option<Instant>, frame: &Frame) -> Result<(), ConnError> {
        let message = frame.encode().map_err(|e| ConnError::Io(e.to_string()))?;
        if self.config.verbose {
            trace!(
                session_key = self.session_key,
                conn_id = self.conn_id,
                frame_id = frame.id,
                frame_type = ?frame.frame_type(),
                len = message.len(),
                "Sending frame"
            );
        }
        self.writer
            .write_message(deadline, message)
            .await
            .map_err(|e| match e {
                TransportError::Timeout => ConnError::WriteTimeout,
                other => other.into(),
            })
    }
}
