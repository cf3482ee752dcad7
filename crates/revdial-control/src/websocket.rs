//! Server-side WebSocket transport backed by axum

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use revdial_transport::{
    MessageSink, MessageSource, Transport, TransportError, TransportResult, WireMessage,
};

/// Wrap an upgraded axum socket as a transport
pub fn axum_transport(socket: WebSocket) -> Transport {
    let (sink, source) = socket.split();
    Transport::new(AxumSink { sink }, AxumSource { source })
}

struct AxumSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl MessageSink for AxumSink {
    async fn send(&mut self, message: WireMessage) -> TransportResult<()> {
        let message = match message {
            WireMessage::Binary(data) => Message::Binary(data),
            WireMessage::Ping(data) => Message::Ping(data),
            WireMessage::Pong(data) => Message::Pong(data),
            WireMessage::Close => Message::Close(None),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::WebSocketError(e.to_string()))
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::WebSocketError(e.to_string()))
    }
}

struct AxumSource {
    source: SplitStream<WebSocket>,
}

#[async_trait]
impl MessageSource for AxumSource {
    async fn recv(&mut self) -> TransportResult<Option<WireMessage>> {
        let message = match self.source.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(TransportError::WebSocketError(e.to_string())),
            None => return Ok(None),
        };

        match message {
            Message::Binary(data) => Ok(Some(WireMessage::Binary(data))),
            Message::Ping(data) => Ok(Some(WireMessage::Ping(data))),
            Message::Pong(data) => Ok(Some(WireMessage::Pong(data))),
            Message::Close(_) => Ok(Some(WireMessage::Close)),
            Message::Text(_) => Err(TransportError::ProtocolError(
                "websocket message type must be binary".to_string(),
            )),
        }
    }
}
