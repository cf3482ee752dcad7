//! WebSocket transport for tunnel sessions
//!
//! Wraps a tokio-tungstenite stream in the [`MessageSink`]/[`MessageSource`]
//! traits. Only binary messages carry frames; a text message is a protocol
//! error.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use revdial_transport::{
    MessageSink, MessageSource, Transport, TransportError, TransportResult, WireMessage,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

pub use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderName, HeaderValue};

/// Client-side WebSocket over plain TCP or TLS
pub type ClientStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Dial `url` (`ws://` or `wss://`) with extra request `headers` and wrap the
/// upgraded socket as a transport.
pub async fn connect(url: &str, headers: HeaderMap) -> TransportResult<Transport> {
    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::WebSocketError(format!("Invalid URL {}: {}", url, e)))?;
    request.headers_mut().extend(headers);

    debug!("Connecting WebSocket to {}", url);
    let (ws_stream, response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(map_ws_error)?;
    debug!(status = %response.status(), "WebSocket connected to {}", url);

    Ok(from_stream(ws_stream))
}

/// Wrap an established WebSocket stream, client or server side
pub fn from_stream<S>(ws_stream: WebSocketStream<S>) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, source) = ws_stream.split();
    Transport::new(WsSink { sink }, WsSource { source })
}

fn map_ws_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::ConnectionClosed
        }
        tungstenite::Error::Io(e) => TransportError::IoError(e),
        other => TransportError::WebSocketError(other.to_string()),
    }
}

pub struct WsSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> MessageSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, message: WireMessage) -> TransportResult<()> {
        let message = match message {
            WireMessage::Binary(data) => Message::Binary(data.to_vec()),
            WireMessage::Ping(data) => Message::Ping(data.to_vec()),
            WireMessage::Pong(data) => Message::Pong(data.to_vec()),
            WireMessage::Close => Message::Close(None),
        };
        self.sink.send(message).await.map_err(map_ws_error)
    }

    async fn close(&mut self) -> TransportResult<()> {
        match self.sink.close().await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(map_ws_error(e)),
        }
    }
}

pub struct WsSource<S> {
    source: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> MessageSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> TransportResult<Option<WireMessage>> {
        loop {
            let message = match self.source.next().await {
                Some(Ok(message)) => message,
                Some(Err(tungstenite::Error::ConnectionClosed))
                | Some(Err(tungstenite::Error::AlreadyClosed))
                | None => return Ok(None),
                Some(Err(e)) => return Err(map_ws_error(e)),
            };

            return match message {
                Message::Binary(data) => Ok(Some(WireMessage::Binary(Bytes::from(data)))),
                Message::Ping(data) => Ok(Some(WireMessage::Ping(Bytes::from(data)))),
                Message::Pong(data) => Ok(Some(WireMessage::Pong(Bytes::from(data)))),
                Message::Close(frame) => {
                    trace!("WebSocket close received: {:?}", frame);
                    Ok(Some(WireMessage::Close))
                }
                Message::Text(_) => Err(TransportError::ProtocolError(
                    "websocket message type must be binary".to_string(),
                )),
                Message::Frame(_) => continue,
            };
        }
    }
}
