//! Dialing the destination of an inbound Connect and piping bytes to it

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::MAX_READ;
use crate::conn::VirtualConn;
use crate::error::ConnError;

/// A dialed byte stream
pub trait NetStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> NetStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Opens the local end of an inbound Connect
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, network: &str, address: &str) -> io::Result<Box<dyn NetStream>>;
}

/// Dials real sockets: `tcp`, `tcp4`, `tcp6` and, on unix, `unix`
#[derive(Debug, Default, Clone, Copy)]
pub struct NetDialer;

#[async_trait]
impl Dialer for NetDialer {
    async fn dial(&self, network: &str, address: &str) -> io::Result<Box<dyn NetStream>> {
        match network {
            "tcp" | "tcp4" | "tcp6" => {
                let stream = TcpStream::connect(address).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            "unix" => Ok(Box::new(tokio::net::UnixStream::connect(address).await?)),
            other => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported network: {}", other),
            )),
        }
    }
}

/// Dial the connection's destination and pipe to it. Failures close the
/// connection with the dial error, which the peer sees as an Error frame.
pub(crate) async fn dial_and_pipe(
    dialer: Arc<dyn Dialer>,
    conn: Arc<VirtualConn>,
    dial_timeout: Duration,
) {
    let addr = conn.remote_addr().clone();
    let dialed = match timeout(dial_timeout, dialer.dial(addr.network(), addr.address())).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err(format!("i/o timeout after {:?}", dial_timeout)),
    };

    match dialed {
        Ok(stream) => {
            debug!(
                conn_id = conn.conn_id(),
                network = %addr.network(),
                address = %addr.address(),
                "Dialed connect target"
            );
            pipe(conn, stream).await;
        }
        Err(reason) => {
            debug!(
                conn_id = conn.conn_id(),
                address = %addr,
                "Failed to dial connect target: {}",
                reason
            );
            conn.close_with(ConnError::Dial {
                address: addr.to_string(),
                reason,
            })
            .await;
        }
    }
}

/// Copy bytes both ways between `conn` and `stream` until either direction
/// ends, then close both. A clean finish closes the connection with `EOF`.
pub async fn pipe<S>(conn: Arc<VirtualConn>, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut net_read, mut net_write) = tokio::io::split(stream);

    // Task 1: tunnel -> network
    let tunnel_to_net = async {
        let mut total_bytes = 0u64;
        loop {
            let chunk = conn.read_chunk(MAX_READ).await?;
            if chunk.is_empty() {
                break;
            }
            net_write.write_all(&chunk).await?;
            total_bytes += chunk.len() as u64;
        }
        if let Err(e) = net_write.shutdown().await {
            debug!(conn_id = conn.conn_id(), "Failed to shut down network write half: {}", e);
        }
        Ok::<u64, ConnError>(total_bytes)
    };

    // Task 2: network -> tunnel
    let net_to_tunnel = async {
        let mut total_bytes = 0u64;
        let mut buffer = vec![0u8; MAX_READ];
        loop {
            let n = net_read.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            conn.write_all(&buffer[..n]).await?;
            total_bytes += n as u64;
        }
        Ok::<u64, ConnError>(total_bytes)
    };

    let result = tokio::select! {
        result = tunnel_to_net => result.map(|n| ("to_network", n)),
        result = net_to_tunnel => result.map(|n| ("to_tunnel", n)),
    };

    let err = match result {
        Ok((direction, bytes)) => {
            debug!(
                conn_id = conn.conn_id(),
                direction = direction,
                bytes = bytes,
                "Pipe finished"
            );
            ConnError::Eof
        }
        Err(e) => {
            debug!(conn_id = conn.conn_id(), "Pipe failed: {}", e);
            e
        }
    };
    conn.close_with(err).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unsupported_network() {
        let err = match NetDialer.dial("udp", "127.0.0.1:53").await {
            Ok(_) => panic!("udp should not be dialable"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
        assert!(err.to_string().contains("udp"));
    }

    #[tokio::test]
    async fn test_tcp_dial() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        let stream = NetDialer.dial("tcp", &addr).await;
        assert!(stream.is_ok());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tcp_dial_refused() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        assert!(NetDialer.dial("tcp", &addr).await.is_err());
    }
}
