//! End-to-end tests: real SOCKS5 servers behind the balancer, a real HTTP
//! origin behind the SOCKS5 servers, and a SOCKS5 client in front.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_socks::tcp::Socks5Stream;

use sockslb::backend::BackendDescriptor;
use sockslb::config::ListenConfig;
use sockslb::health::{HealthChecker, HealthCheckerConfig};
use sockslb::probe::SocksProber;
use sockslb::server::ForwardingServer;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// HTTP origin answering every request with a SUCCESS body.
struct TestHttpServer {
    port: u16,
    requests: Arc<AtomicUsize>,
}

impl TestHttpServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&requests);

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    if stream.read(&mut buf).await.unwrap_or(0) == 0 {
                        return;
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\nConnection: close\r\n\r\nSUCCESS",
                        )
                        .await;
                });
            }
        });

        Self { port, requests }
    }

    fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

/// SOCKS5 server on a fixed port with a per-connection latency, stoppable
/// and restartable to exercise failover.
struct TestSocksServer {
    port: u16,
    latency: Duration,
    handle: Option<JoinHandle<()>>,
}

impl TestSocksServer {
    async fn start(port: u16, latency: Duration) -> Self {
        let mut server = Self {
            port,
            latency,
            handle: None,
        };
        server.resume().await;
        server
    }

    async fn resume(&mut self) {
        let listener = TcpListener::bind(("127.0.0.1", self.port)).await.unwrap();
        let latency = self.latency;
        self.handle = Some(tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(serve_socks(stream, latency));
            }
        }));
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn serve_socks(mut stream: TcpStream, latency: Duration) {
    tokio::time::sleep(latency).await;

    // negotiation
    let mut header = [0u8; 2];
    if stream.read_exact(&mut header).await.is_err() {
        return;
    }
    let mut methods = vec![0u8; header[1] as usize];
    if stream.read_exact(&mut methods).await.is_err() {
        return;
    }
    if stream.write_all(&[0x05, 0x00]).await.is_err() {
        return;
    }

    // CONNECT request, IPv4 or domain address
    let mut request = [0u8; 4];
    if stream.read_exact(&mut request).await.is_err() {
        return;
    }
    let host = match request[3] {
        0x01 => {
            let mut addr = [0u8; 4];
            if stream.read_exact(&mut addr).await.is_err() {
                return;
            }
            format!("{}.{}.{}.{}", addr[0], addr[1], addr[2], addr[3])
        }
        0x03 => {
            let mut len = [0u8; 1];
            if stream.read_exact(&mut len).await.is_err() {
                return;
            }
            let mut name = vec![0u8; len[0] as usize];
            if stream.read_exact(&mut name).await.is_err() {
                return;
            }
            String::from_utf8_lossy(&name).to_string()
        }
        _ => return,
    };
    let mut port = [0u8; 2];
    if stream.read_exact(&mut port).await.is_err() {
        return;
    }
    let port = u16::from_be_bytes(port);

    let Ok(mut upstream) = TcpStream::connect((host.as_str(), port)).await else {
        let _ = stream
            .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await;
        return;
    };
    if stream
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .is_err()
    {
        return;
    }

    let _ = copy_bidirectional(&mut stream, &mut upstream).await;
}

fn direct_descriptor(name: &str, port: u16) -> BackendDescriptor {
    serde_json::from_value(json!({
        "type": "direct",
        "name": name,
        "params": {"host": "127.0.0.1", "port": port},
    }))
    .unwrap()
}

struct Balancer {
    health: Arc<HealthChecker>,
    port: u16,
    shutdown: watch::Sender<bool>,
}

async fn start_balancer(descriptors: Vec<BackendDescriptor>, http_port: u16) -> Balancer {
    let prober = SocksProber::new(
        Duration::from_secs(2),
        &format!("http://127.0.0.1:{}", http_port),
    )
    .unwrap();
    let health = Arc::new(HealthChecker::new(
        descriptors,
        HealthCheckerConfig {
            check_interval: Duration::from_secs(2),
            current_check_interval: Duration::from_secs(1),
            workers: 5,
        },
        prober,
    ));

    let port = free_port();
    let listen = ListenConfig {
        host: "127.0.0.1".to_string(),
        port,
        so_rcvbuf: None,
        so_sndbuf: None,
    };

    let (shutdown, shutdown_rx) = watch::channel(false);
    {
        let health = Arc::clone(&health);
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { health.run(rx).await });
    }
    {
        let server = ForwardingServer::new(listen, Arc::clone(&health));
        tokio::spawn(async move {
            let _ = server.run(shutdown_rx).await;
        });
    }

    Balancer {
        health,
        port,
        shutdown,
    }
}

async fn wait_for_selection(balancer: &Balancer, name: &str, deadline: Duration) {
    let started = tokio::time::Instant::now();
    loop {
        if let Some(selection) = balancer.health.selection() {
            if selection.client.name() == name {
                return;
            }
        }
        assert!(
            started.elapsed() < deadline,
            "backend {} was not selected within {:?} (current: {:?})",
            name,
            deadline,
            balancer
                .health
                .selection()
                .map(|s| s.client.name().to_string())
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// One HTTP request through the balancer, speaking SOCKS5 to it.
async fn request_through(balancer_port: u16, http_port: u16) -> String {
    let mut stream = Socks5Stream::connect(
        ("127.0.0.1", balancer_port),
        ("127.0.0.1", http_port),
    )
    .await
    .expect("SOCKS5 connect through balancer failed");

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).to_string()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failover_and_recovery() {
    let http = TestHttpServer::start().await;
    let fast_port = free_port();
    let medium_port = free_port();
    let slow_port = free_port();

    let mut fast = TestSocksServer::start(fast_port, Duration::from_millis(10)).await;
    let _medium = TestSocksServer::start(medium_port, Duration::from_millis(100)).await;
    let _slow = TestSocksServer::start(slow_port, Duration::from_millis(300)).await;

    let balancer = start_balancer(
        vec![
            direct_descriptor("fast", fast_port),
            direct_descriptor("medium", medium_port),
            direct_descriptor("slow", slow_port),
        ],
        http.port,
    )
    .await;

    wait_for_selection(&balancer, "fast", Duration::from_secs(10)).await;

    let response = request_through(balancer.port, http.port).await;
    assert!(response.ends_with("SUCCESS"), "got: {}", response);
    assert!(http.request_count() >= 1);

    // fastest backend dies; the next sweep falls over to medium
    fast.stop();
    wait_for_selection(&balancer, "medium", Duration::from_secs(10)).await;
    let response = request_through(balancer.port, http.port).await;
    assert!(response.ends_with("SUCCESS"));

    // it comes back; a later sweep switches back to it
    fast.resume().await;
    wait_for_selection(&balancer, "fast", Duration::from_secs(10)).await;

    // concurrent traffic all lands
    let mut tasks = Vec::new();
    for _ in 0..10 {
        let port = balancer.port;
        let http_port = http.port;
        tasks.push(tokio::spawn(async move {
            request_through(port, http_port).await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().ends_with("SUCCESS"));
    }

    let _ = balancer.shutdown.send(true);
    balancer.health.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_backend_drops_connections() {
    let http = TestHttpServer::start().await;
    let balancer = start_balancer(Vec::new(), http.port).await;

    // no selection will ever exist; the forwarder closes the connection
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut stream = TcpStream::connect(("127.0.0.1", balancer.port))
        .await
        .unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut buf = [0u8; 2];
    let n = stream.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0, "connection should close without a backend");

    let _ = balancer.shutdown.send(true);
    balancer.health.shutdown().await;
}
