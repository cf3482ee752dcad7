//! WebSocket transport against a local tungstenite server

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use revdial_transport::{split, TransportError, WireMessage};
use revdial_transport_websocket::{connect, from_stream, HeaderMap, HeaderValue};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

#[tokio::test]
async fn test_binary_round_trip_with_headers() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (header_tx, header_rx) = oneshot::channel();

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut seen = None;
        let ws = tokio_tungstenite::accept_hdr_async(tcp, |req: &Request, resp: Response| {
            seen = req
                .headers()
                .get("x-tunnel-id")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            Ok(resp)
        })
        .await
        .unwrap();
        header_tx.send(seen).unwrap();

        let mut transport = from_stream(ws);
        let message = transport.source.recv().await.unwrap();
        assert_eq!(message, Some(WireMessage::Binary(Bytes::from_static(b"hello"))));
        transport
            .sink
            .send(WireMessage::Binary(Bytes::from_static(b"world")))
            .await
            .unwrap();
        // Wait for the client to go away.
        while let Ok(Some(_)) = transport.source.recv().await {}
    });

    let mut headers = HeaderMap::new();
    headers.insert("x-tunnel-id", HeaderValue::from_static("agent-7"));
    let mut client = connect(&format!("ws://{}/connect", addr), headers)
        .await
        .unwrap();

    assert_eq!(header_rx.await.unwrap().as_deref(), Some("agent-7"));

    client
        .sink
        .send(WireMessage::Binary(Bytes::from_static(b"hello")))
        .await
        .unwrap();
    assert_eq!(
        client.source.recv().await.unwrap(),
        Some(WireMessage::Binary(Bytes::from_static(b"world")))
    );

    let _ = client.sink.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_ping_answered_through_wrapper() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Raw tungstenite peer that pings and waits for the pong.
    let peer = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        ws.send(Message::Ping(b"hb".to_vec())).await.unwrap();
        loop {
            match ws.next().await {
                Some(Ok(Message::Pong(payload))) => {
                    assert_eq!(payload, b"hb".to_vec());
                    break;
                }
                Some(Ok(_)) => continue,
                other => panic!("peer ended before pong: {:?}", other),
            }
        }
        ws.send(Message::Binary(b"after".to_vec())).await.unwrap();
        let _ = ws.close(None).await;
    });

    let transport = connect(&format!("ws://{}/", addr), HeaderMap::new())
        .await
        .unwrap();
    let (_writer, mut reader) = split(transport, Duration::from_secs(5), Duration::from_secs(1));

    assert_eq!(
        reader.next_message().await.unwrap(),
        Bytes::from_static(b"after")
    );
    peer.await.unwrap();
}

#[tokio::test]
async fn test_text_message_is_protocol_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        ws.send(Message::Text("not a frame".to_string())).await.unwrap();
        let _ = ws.next().await;
    });

    let mut client = connect(&format!("ws://{}/", addr), HeaderMap::new())
        .await
        .unwrap();
    assert!(matches!(
        client.source.recv().await,
        Err(TransportError::ProtocolError(_))
    ));
}

#[tokio::test]
async fn test_connect_refused() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    assert!(connect(&format!("ws://{}/", addr), HeaderMap::new())
        .await
        .is_err());
}

#[tokio::test]
async fn test_invalid_url() {
    assert!(matches!(
        connect("not a url", HeaderMap::new()).await,
        Err(TransportError::WebSocketError(_))
    ));
}
