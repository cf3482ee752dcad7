//! Tunnel server over real WebSocket connections

use revdial_connection::{allow_all, Session, SessionConfig};
use revdial_control::{
    ForwardConfig, ForwardServer, HeaderAuthorizer, SessionRegistry, TunnelServer,
    TUNNEL_ID_HEADER, TUNNEL_TOKEN_HEADER,
};
use revdial_transport_websocket::{connect, HeaderMap, HeaderValue};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

async fn start_server(token: Option<&str>) -> (Arc<SessionRegistry>, String) {
    let registry = Arc::new(SessionRegistry::default());
    let authorizer = Arc::new(HeaderAuthorizer::new(token.map(String::from)));
    let server = TunnelServer::new(registry.clone(), authorizer);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server.router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (registry, format!("ws://{}/connect", addr))
}

fn agent_headers(id: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(TUNNEL_ID_HEADER, HeaderValue::from_static(id));
    headers
}

async fn start_agent(url: &str, headers: HeaderMap) -> Arc<Session> {
    let transport = connect(url, headers).await.unwrap();
    let session = Session::new_client(transport, allow_all(), SessionConfig::default());
    let serving = session.clone();
    tokio::spawn(async move { serving.serve().await });
    session
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_dial_through_connected_agent() {
    init_tracing();
    let (registry, url) = start_server(None).await;
    let echo = echo_server().await;
    let agent = start_agent(&url, agent_headers("agent-1")).await;

    wait_until(|| registry.has_session("agent-1")).await;

    let dialer = registry.dialer("agent-1").unwrap();
    assert!(!dialer.is_routed());
    let conn = dialer.dial("tcp", &echo, None).await.unwrap();
    conn.write_all(b"ping over websocket").await.unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 64];
    while received.len() < 19 {
        let n = timeout(Duration::from_secs(5), conn.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0);
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, b"ping over websocket");

    conn.close().await;
    agent.close().await;
    wait_until(|| !registry.has_session("agent-1")).await;
    assert_eq!(registry.session_count(), 0);
}

#[tokio::test]
async fn test_missing_tunnel_id_rejected() {
    let (registry, url) = start_server(None).await;
    assert!(connect(&url, HeaderMap::new()).await.is_err());
    assert_eq!(registry.session_count(), 0);
}

#[tokio::test]
async fn test_token_required() {
    let (registry, url) = start_server(Some("s3cret")).await;
    assert!(connect(&url, agent_headers("agent-1")).await.is_err());

    let mut headers = agent_headers("agent-1");
    headers.insert(TUNNEL_TOKEN_HEADER, HeaderValue::from_static("s3cret"));
    let _agent = start_agent(&url, headers).await;
    wait_until(|| registry.has_session("agent-1")).await;
}

#[tokio::test]
async fn test_forward_tcp_through_tunnel() {
    init_tracing();
    let (registry, url) = start_server(None).await;
    let echo = echo_server().await;
    let _agent = start_agent(&url, agent_headers("agent-1")).await;
    wait_until(|| registry.has_session("agent-1")).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let forward_addr: SocketAddr = listener.local_addr().unwrap();
    let forward = ForwardServer::new(
        ForwardConfig {
            bind_addr: forward_addr,
            target: format!("agent-1/tcp/{}", echo).parse().unwrap(),
            dial_timeout: None,
        },
        registry.clone(),
    );
    tokio::spawn(async move { forward.serve(listener).await });

    let mut socket = TcpStream::connect(forward_addr).await.unwrap();
    socket.write_all(b"forwarded").await.unwrap();
    let mut buf = [0u8; 9];
    timeout(Duration::from_secs(5), socket.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"forwarded");
}

#[tokio::test]
async fn test_forward_to_unknown_client_drops_socket() {
    let (registry, _url) = start_server(None).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let forward_addr = listener.local_addr().unwrap();
    let forward = ForwardServer::new(
        ForwardConfig {
            bind_addr: forward_addr,
            target: "nobody/tcp/127.0.0.1:1".parse().unwrap(),
            dial_timeout: None,
        },
        registry,
    );
    tokio::spawn(async move { forward.serve(listener).await });

    let mut socket = TcpStream::connect(forward_addr).await.unwrap();
    let mut buf = [0u8; 8];
    let n = timeout(Duration::from_secs(5), socket.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}
