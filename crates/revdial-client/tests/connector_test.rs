//! Connector and peer links against in-process tunnel servers

use revdial_client::{
    AllowList, CancellationToken, ConnectError, Connector, PeerLink, ReconnectConfig,
};
use revdial_connection::{allow_all, SessionConfig};
use revdial_control::{HeaderAuthorizer, SessionRegistry, TunnelServer, TUNNEL_ID_HEADER};
use revdial_transport_websocket::{HeaderMap, HeaderValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::{timeout, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

async fn start_server() -> (Arc<SessionRegistry>, String) {
    let registry = Arc::new(SessionRegistry::default());
    let server = TunnelServer::new(registry.clone(), Arc::new(HeaderAuthorizer::default()));

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

async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    format!("ws://{}/connect", listener.local_addr().unwrap())
}

async fn assert_echo(dialer: &revdial_control::SessionDialer, echo: &str, message: &[u8]) {
    let conn = dialer.dial("tcp", echo, None).await.unwrap();
    conn.write_all(message).await.unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 256];
    while received.len() < message.len() {
        let n = timeout(Duration::from_secs(5), conn.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "connection ended early");
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, message);
    conn.close().await;
}

#[tokio::test]
async fn test_connect_forever_serves_until_cancelled() {
    init_tracing();
    let (registry, url) = start_server().await;
    let echo = echo_server().await;

    let connector = Connector::new(url, agent_headers("agent-1"), allow_all());
    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { connector.connect_forever(&cancel).await })
    };

    wait_until(|| registry.has_session("agent-1")).await;
    let dialer = registry.dialer("agent-1").unwrap();
    assert_echo(&dialer, &echo, b"through the connector").await;

    cancel.cancel();
    let result = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert!(result.is_ok());
    wait_until(|| !registry.has_session("agent-1")).await;
}

#[tokio::test]
async fn test_connect_refused_waits_retry_delay() {
    let connector = Connector::new(closed_port_url().await, agent_headers("agent-1"), allow_all())
        .with_reconnect(ReconnectConfig::fixed(Duration::from_millis(200)));

    let start = Instant::now();
    let result = connector.client_connect(&CancellationToken::new()).await;
    assert!(matches!(result, Err(ConnectError::Transport(_))));
    assert!(start.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn test_cancelled_attempt_skips_retry_delay() {
    let connector = Connector::new(closed_port_url().await, agent_headers("agent-1"), allow_all());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let start = Instant::now();
    let result = connector.client_connect(&cancel).await;
    assert!(matches!(result, Err(ConnectError::Cancelled)));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_on_connect_error_ends_attempt() {
    let (registry, url) = start_server().await;
    let connector = Connector::new(url, agent_headers("agent-1"), allow_all())
        .with_reconnect(ReconnectConfig::fixed(Duration::from_millis(10)))
        .on_connect(|session| async move {
            assert!(!session.is_closed());
            Err(ConnectError::callback("not today"))
        });

    let result = connector.client_connect(&CancellationToken::new()).await;
    match result {
        Err(ConnectError::Callback(message)) => assert_eq!(message, "not today"),
        other => panic!("unexpected result: {:?}", other),
    }
    wait_until(|| !registry.has_session("agent-1")).await;
}

#[tokio::test]
async fn test_on_connect_success_keeps_serving() {
    let (registry, url) = start_server().await;
    let echo = echo_server().await;
    let connector = Connector::new(url, agent_headers("agent-1"), allow_all())
        .on_connect(|_session| async move { Ok(()) });

    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { connector.client_connect(&cancel).await })
    };

    wait_until(|| registry.has_session("agent-1")).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!task.is_finished());
    assert!(registry.has_session("agent-1"));

    let dialer = registry.dialer("agent-1").unwrap();
    assert_echo(&dialer, &echo, b"still serving").await;

    cancel.cancel();
    let result = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert!(matches!(result, Err(ConnectError::Cancelled)));
}

#[tokio::test]
async fn test_allow_list_rejects_connect() {
    let (registry, url) = start_server().await;
    let echo = echo_server().await;

    let auth = AllowList::new(vec!["unix".into()], vec![]).into_authorizer();
    let connector = Connector::new(url, agent_headers("agent-1"), auth);
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move { connector.connect_forever(&cancel).await });
    }
    wait_until(|| registry.has_session("agent-1")).await;

    let conn = registry
        .dialer("agent-1")
        .unwrap()
        .dial("tcp", &echo, None)
        .await
        .unwrap();
    let mut buf = [0u8; 16];
    let err = timeout(Duration::from_secs(5), conn.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.to_string(), "connect not allowed");
    cancel.cancel();
}

#[tokio::test]
async fn test_federated_dial_through_peer() {
    init_tracing();
    let (registry_a, url_a) = start_server().await;
    let (registry_b, url_b) = start_server().await;
    let echo = echo_server().await;
    let cancel = CancellationToken::new();

    // Server A links to server B.
    let link = PeerLink::new(url_b, "server-a", registry_a.clone())
        .with_session_config(SessionConfig::default())
        .with_reconnect(ReconnectConfig::fixed(Duration::from_millis(50)));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move { link.run(&cancel).await });
    }

    // The agent connects to server A only.
    let agent_cancel = CancellationToken::new();
    let agent = Connector::new(url_a, agent_headers("agent-1"), allow_all());
    {
        let cancel = agent_cancel.clone();
        tokio::spawn(async move { agent.connect_forever(&cancel).await });
    }

    wait_until(|| registry_b.peer_keys() == vec!["server-a".to_string()]).await;
    wait_until(|| {
        registry_b
            .dialer("agent-1")
            .map(|d| d.is_routed())
            .unwrap_or(false)
    })
    .await;
    assert!(!registry_b.has_session("agent-1"));

    let dialer = registry_b.dialer("agent-1").unwrap();
    assert_echo(&dialer, &echo, b"across two servers").await;

    // Withdrawn from B once the agent leaves A.
    agent_cancel.cancel();
    wait_until(|| registry_b.dialer("agent-1").is_err()).await;
    cancel.cancel();
}
