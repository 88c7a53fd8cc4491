//! Transparent TCP forwarder in front of the selected backend.
//!
//! The listener accepts plain TCP and splices every connection to whichever
//! SOCKS5 backend the health checker currently selects. No SOCKS parsing
//! happens here: the client speaks SOCKS5 end to end with the backend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::backend::endpoint::Endpoint;
use crate::config::ListenConfig;
use crate::error::{BalancerError, Result};
use crate::health::HealthChecker;

const BACKEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ForwardingServer {
    config: ListenConfig,
    health: Arc<HealthChecker>,
}

impl ForwardingServer {
    pub fn new(config: ListenConfig, health: Arc<HealthChecker>) -> Self {
        Self { config, health }
    }

    /// Accept until `shutdown` flips to true. Each connection is handled on
    /// its own task; in-flight connections finish on their own.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = self.bind()?;
        info!("Listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let health = Arc::clone(&self.health);
                            let config = self.config.clone();
                            tokio::spawn(async move {
                                if let Err(e) = forward_client(stream, peer, &config, &health).await {
                                    debug!("Connection from {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                        }
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Forwarding server stopping");
        Ok(())
    }

    fn bind(&self) -> Result<TcpListener> {
        let addr: SocketAddr = self
            .config
            .listen_addr()
            .parse()
            .map_err(|e| BalancerError::InvalidConfig(format!("invalid listen address: {}", e)))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        // accepted sockets inherit these options from the listener, which
        // keeps the client leg tuned the same way as the backend leg
        socket.set_keepalive(true)?;
        if let Some(size) = self.config.so_rcvbuf {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.config.so_sndbuf {
            socket.set_send_buffer_size(size)?;
        }
        socket.bind(addr)?;
        Ok(socket.listen(1024)?)
    }
}

async fn forward_client(
    client: TcpStream,
    peer: SocketAddr,
    config: &ListenConfig,
    health: &HealthChecker,
) -> Result<()> {
    let Some(endpoint) = health.selected_endpoint() else {
        warn!("No backend selected, dropping connection from {}", peer);
        return Ok(());
    };

    client.set_nodelay(true)?;
    let backend = connect_backend(&endpoint, config).await?;
    debug!("Forwarding {} -> {}", peer, endpoint);

    let (to_backend, to_client) = relay(client, backend).await;
    debug!(
        "Connection {} -> {} closed ({}B out, {}B in)",
        peer, endpoint, to_backend, to_client
    );
    Ok(())
}

async fn connect_backend(endpoint: &Endpoint, config: &ListenConfig) -> Result<TcpStream> {
    let addr = lookup_host(endpoint.authority())
        .await
        .map_err(|e| BalancerError::Forward(format!("resolve {} failed: {}", endpoint, e)))?
        .next()
        .ok_or_else(|| BalancerError::Forward(format!("no address for {}", endpoint)))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(size) = config.so_rcvbuf {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = config.so_sndbuf {
        socket.set_send_buffer_size(size)?;
    }
    socket.set_keepalive(true)?;

    let stream = timeout(BACKEND_CONNECT_TIMEOUT, socket.connect(addr))
        .await
        .map_err(|_| BalancerError::Forward(format!("connect {} timed out", endpoint)))?
        .map_err(|e| BalancerError::Forward(format!("connect {} failed: {}", endpoint, e)))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Splice two streams together until both directions reach EOF.
///
/// Each side's write half is shut down when the opposite read half ends, so
/// half-closed connections drain cleanly. Returns bytes moved in each
/// direction.
pub(crate) async fn relay<C, B>(client: C, backend: B) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut client_read, mut client_write) = io::split(client);
    let (mut backend_read, mut backend_write) = io::split(backend);

    let outbound = tokio::spawn(async move {
        let copied = io::copy(&mut client_read, &mut backend_write)
            .await
            .unwrap_or(0);
        let _ = backend_write.shutdown().await;
        copied
    });
    let inbound = tokio::spawn(async move {
        let copied = io::copy(&mut backend_read, &mut client_write)
            .await
            .unwrap_or(0);
        let _ = client_write.shutdown().await;
        copied
    });

    match tokio::join!(outbound, inbound) {
        (Ok(sent), Ok(received)) => (sent, received),
        (sent, received) => {
            error!("Relay task panicked");
            (sent.unwrap_or(0), received.unwrap_or(0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthCheckerConfig;
    use crate::probe::SocksProber;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_bind_applies_socket_tuning() {
        let config = ListenConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            so_rcvbuf: Some(64 * 1024),
            so_sndbuf: Some(64 * 1024),
        };
        let health = Arc::new(HealthChecker::new(
            Vec::new(),
            HealthCheckerConfig::default(),
            SocksProber::new(Duration::from_secs(1), "http://test.example").unwrap(),
        ));
        let server = ForwardingServer::new(config, health);

        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();

        // a tuned listener still accepts; accepted sockets carry its options
        let client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        assert!(accepted.peer_addr().is_ok());
        drop(client);
    }

    #[tokio::test]
    async fn test_relay_moves_bytes_both_ways() {
        let (client_near, client_far) = duplex(1024);
        let (backend_near, backend_far) = duplex(1024);

        let relay_task = tokio::spawn(relay(client_far, backend_far));

        let (mut client_read, mut client_write) = io::split(client_near);
        let (mut backend_read, mut backend_write) = io::split(backend_near);

        client_write.write_all(b"request").await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut seen = vec![0u8; 7];
        backend_read.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen, b"request");

        backend_write.write_all(b"response!").await.unwrap();
        backend_write.shutdown().await.unwrap();

        let mut answer = Vec::new();
        client_read.read_to_end(&mut answer).await.unwrap();
        assert_eq!(&answer, b"response!");

        let (sent, received) = relay_task.await.unwrap();
        assert_eq!(sent, 7);
        assert_eq!(received, 9);
    }

    #[tokio::test]
    async fn test_relay_handles_immediate_eof() {
        let (client_near, client_far) = duplex(64);
        let (backend_near, backend_far) = duplex(64);

        drop(client_near);
        drop(backend_near);

        let (sent, received) = relay(client_far, backend_far).await;
        assert_eq!(sent, 0);
        assert_eq!(received, 0);
    }
}
