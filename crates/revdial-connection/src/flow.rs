//! Per-connection inbound buffer and backpressure state
//!
//! Both halves live under one mutex. Waiters park on a [`Notify`] and create
//! their `notified()` future before checking the state, so a wakeup between the
//! check and the await is never lost.

use bytes::{Bytes, BytesMut};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

use crate::error::ConnError;

/// Large idle buffers are released once drained
const SHRINK_THRESHOLD: usize = 64 * 1024;

/// Pause or Resume frame owed to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSignal {
    Pause,
    Resume,
}

#[derive(Debug, Default)]
struct FlowState {
    buf: BytesMut,
    offered: u64,
    read: u64,
    err: Option<ConnError>,
    read_deadline: Option<Instant>,
    /// We told the peer to pause
    pause_sent: bool,
    /// The peer told us to pause
    remote_paused: bool,
    /// Writers stop waiting on the peer
    closed: bool,
}

/// Inbound buffer plus the two backpressure flags of a virtual connection
#[derive(Debug)]
pub struct FlowControl {
    state: Mutex<FlowState>,
    notify: Notify,
    high: usize,
    low: usize,
}

impl FlowControl {
    /// `high` is the pause watermark; resume happens below `high / 8`.
    pub fn new(high: usize) -> Self {
        Self {
            state: Mutex::new(FlowState::default()),
            notify: Notify::new(),
            high,
            low: high / 8,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append inbound data. Fails with the terminal error once closed.
    pub fn offer(&self, data: &[u8]) -> Result<(), ConnError> {
        let mut state = self.lock();
        if let Some(err) = &state.err {
            return Err(err.clone());
        }
        if !data.is_empty() {
            state.buf.extend_from_slice(data);
            state.offered += data.len() as u64;
            self.notify.notify_waiters();
        }
        Ok(())
    }

    /// Take up to `max` buffered bytes, waiting while the buffer is empty.
    ///
    /// Buffered data is drained before the terminal error is reported.
    pub async fn read_chunk(&self, max: usize) -> Result<Bytes, ConnError> {
        loop {
            let notified = self.notify.notified();

            let deadline = {
                let mut state = self.lock();
                if !state.buf.is_empty() {
                    let n = max.min(state.buf.len());
                    let chunk = state.buf.split_to(n).freeze();
                    state.read += n as u64;
                    if state.buf.is_empty() && state.buf.capacity() > SHRINK_THRESHOLD {
                        state.buf = BytesMut::new();
                    }
                    return Ok(chunk);
                }
                if let Some(err) = &state.err {
                    return Err(err.clone());
                }
                if let Some(deadline) = state.read_deadline {
                    if Instant::now() >= deadline {
                        return Err(ConnError::DeadlineExceeded);
                    }
                }
                state.read_deadline
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Evaluate the watermarks and flip the local pause flag if a signal is due.
    ///
    /// Returns `Pause` once when the buffer rises above the high watermark and
    /// `Resume` once when it drops below the low watermark again.
    pub fn watermark_signal(&self) -> Option<FlowSignal> {
        let mut state = self.lock();
        if state.err.is_some() {
            return None;
        }
        let buffered = state.buf.len();
        if !state.pause_sent && buffered > self.high {
            state.pause_sent = true;
            Some(FlowSignal::Pause)
        } else if state.pause_sent && buffered < self.low {
            state.pause_sent = false;
            Some(FlowSignal::Resume)
        } else {
            None
        }
    }

    /// Record the terminal error. The first error wins; returns whether this
    /// call was the one that closed.
    pub fn close(&self, err: ConnError) -> bool {
        let first = {
            let mut state = self.lock();
            if state.err.is_none() {
                state.err = Some(err);
                true
            } else {
                false
            }
        };
        self.notify.notify_waiters();
        first
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.lock().read_deadline = deadline;
        self.notify.notify_waiters();
    }

    pub fn on_pause(&self) {
        self.lock().remote_paused = true;
        self.notify.notify_waiters();
    }

    pub fn on_resume(&self) {
        self.lock().remote_paused = false;
        self.notify.notify_waiters();
    }

    /// Release every writer blocked on the peer
    pub fn close_backpressure(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Wait while the peer has us paused and nothing is closed.
    ///
    /// `on_wake` runs after each wakeup that finds the peer still pausing.
    pub async fn wait<F: FnMut()>(&self, mut on_wake: F) {
        let mut woken = false;
        loop {
            let notified = self.notify.notified();
            {
                let state = self.lock();
                if !state.remote_paused || state.closed || state.err.is_some() {
                    return;
                }
            }
            if woken {
                on_wake();
            }
            notified.await;
            woken = true;
        }
    }

    pub fn terminal_error(&self) -> Option<ConnError> {
        self.lock().err.clone()
    }

    pub fn is_closed(&self) -> bool {
        let state = self.lock();
        state.closed || state.err.is_some()
    }

    pub fn buffered(&self) -> usize {
        self.lock().buf.len()
    }

    /// Total bytes offered and read so far
    pub fn counters(&self) -> (u64, u64) {
        let state = self.lock();
        (state.offered, state.read)
    }

    pub fn is_paused(&self) -> bool {
        self.lock().pause_sent
    }

    pub fn is_remote_paused(&self) -> bool {
        self.lock().remote_paused
    }
}
