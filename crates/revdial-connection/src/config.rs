//! Session tuning knobs
//!
//! Both ends of a tunnel must agree on the buffer watermark, otherwise one
//! side pauses the other far more often than needed.

use std::time::Duration;

/// High watermark per virtual connection (2 MiB)
pub const MAX_BUFFER: usize = 1 << 21;

/// Size of each read from a dialed network connection
pub const MAX_READ: usize = 8192;

/// How often the client side pings the server
pub const PING_WRITE_INTERVAL: Duration = Duration::from_secs(5);

/// How long a side waits for any inbound message before declaring the peer dead
pub const PING_WAIT_DURATION: Duration = Duration::from_secs(60);

/// How often the client side reports its active connection IDs
pub const SYNC_CONNECTIONS_INTERVAL: Duration = Duration::from_secs(60);

/// Send timeout for control frames (Connect, Error, Pause, Resume, pings)
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an inbound Connect may take to dial its destination
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// High watermark `H`; the low watermark is `H / 8`
    pub max_buffer: usize,
    /// Ping interval (client role)
    pub ping_interval: Duration,
    /// Peer liveness timeout, renewed by every inbound message
    pub read_timeout: Duration,
    /// SyncConnections interval (client role)
    pub sync_interval: Duration,
    /// Send timeout for control frames
    pub control_timeout: Duration,
    /// Default timeout for dialing, both through the tunnel and for inbound Connects
    pub dial_timeout: Duration,
    /// Connections younger than this survive SyncConnections reconciliation.
    /// Zero closes every id the peer no longer reports.
    pub stale_grace: Duration,
    /// Log every frame sent and received
    pub verbose: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_buffer: MAX_BUFFER,
            ping_interval: PING_WRITE_INTERVAL,
            read_timeout: PING_WAIT_DURATION,
            sync_interval: SYNC_CONNECTIONS_INTERVAL,
            control_timeout: HANDSHAKE_TIMEOUT,
            dial_timeout: DIAL_TIMEOUT,
            stale_grace: Duration::ZERO,
            verbose: false,
        }
    }
}

impl SessionConfig {
    pub fn low_watermark(&self) -> usize {
        self.max_buffer / 8
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}
