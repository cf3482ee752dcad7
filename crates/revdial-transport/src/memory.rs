//! In-process transport pair backed by channels

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{MessageSink, MessageSource, Transport, TransportError, TransportResult, WireMessage};

/// Create two connected transports. Messages sent on one arrive on the other.
pub fn pair(capacity: usize) -> (Transport, Transport) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);

    (
        Transport::new(MemorySink { tx: Some(a_tx) }, MemorySource { rx: a_rx }),
        Transport::new(MemorySink { tx: Some(b_tx) }, MemorySource { rx: b_rx }),
    )
}

#[derive(Debug)]
pub struct MemorySink {
    tx: Option<mpsc::Sender<WireMessage>>,
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn send(&mut self, message: WireMessage) -> TransportResult<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(message)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.tx = None;
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemorySource {
    rx: mpsc::Receiver<WireMessage>,
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn recv(&mut self) -> TransportResult<Option<WireMessage>> {
        Ok(self.rx.recv().await)
    }
}
