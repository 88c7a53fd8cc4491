//! SOCKS5 connectivity probe.
//!
//! Performs the full client-side path a real consumer would: no-auth
//! negotiation, a domain-typed CONNECT to the configured test target, and a
//! minimal HTTP exchange through the resulting tunnel. Latency is wall-clock
//! time from connection open to validated HTTP response.

use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use url::Url;

use crate::backend::endpoint::Endpoint;
use crate::error::{BalancerError, Result};

use super::ProbeResult;

/// Probes SOCKS5 backends by tunneling a minimal HTTP request through them.
pub struct SocksProber {
    timeout: Duration,
    test_host: String,
    test_port: u16,
}

impl SocksProber {
    /// `test_url` is parsed once here; its host/port are reused for every
    /// probe. The port defaults to 80.
    pub fn new(timeout: Duration, test_url: &str) -> Result<Self> {
        let url = Url::parse(test_url)?;
        let test_host = url
            .host_str()
            .ok_or_else(|| {
                BalancerError::InvalidConfig(format!("test_url has no host: {}", test_url))
            })?
            .to_string();
        let test_port = url.port().unwrap_or(80);

        Ok(Self {
            timeout,
            test_host,
            test_port,
        })
    }

    /// Run the handshake + CONNECT + HTTP sequence against `endpoint`.
    pub async fn probe(&self, endpoint: &Endpoint) -> ProbeResult<Endpoint> {
        debug!(
            "Testing backend {} for {}:{}",
            endpoint, self.test_host, self.test_port
        );
        let started = Instant::now();

        match timeout(self.timeout, self.check(endpoint)).await {
            Ok(Ok(())) => {
                let latency = started.elapsed().as_millis() as i64;
                debug!("Backend {} test successful, latency: {}ms", endpoint, latency);
                ProbeResult::success(endpoint.clone(), latency)
            }
            Ok(Err(message)) => {
                debug!("Backend {} test failed: {}", endpoint, message);
                ProbeResult::failure(endpoint.clone(), message)
            }
            Err(_) => {
                debug!("Backend {} test timed out", endpoint);
                ProbeResult::failure(
                    endpoint.clone(),
                    format!("timeout after {}ms", self.timeout.as_millis()),
                )
            }
        }
    }

    async fn check(&self, endpoint: &Endpoint) -> std::result::Result<(), String> {
        let mut stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| format!("connect failed: {}", e))?;

        // No-auth negotiation
        stream
            .write_all(&[0x05, 0x01, 0x00])
            .await
            .map_err(|e| format!("handshake write failed: {}", e))?;
        let mut reply = [0u8; 2];
        stream
            .read_exact(&mut reply)
            .await
            .map_err(|e| format!("handshake read failed: {}", e))?;
        if reply != [0x05, 0x00] {
            return Err("SOCKS5 handshake failed".to_string());
        }

        // CONNECT with a domain-typed address
        let host = self.test_host.as_bytes();
        let mut request = Vec::with_capacity(7 + host.len());
        request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host.len() as u8]);
        request.extend_from_slice(host);
        request.extend_from_slice(&self.test_port.to_be_bytes());
        stream
            .write_all(&request)
            .await
            .map_err(|e| format!("CONNECT write failed: {}", e))?;

        // only the first two reply bytes matter; the rest is bind address
        // padding
        let mut reply = [0u8; 10];
        let n = stream
            .read(&mut reply)
            .await
            .map_err(|e| format!("CONNECT read failed: {}", e))?;
        if n < 2 || reply[0] != 0x05 || reply[1] != 0x00 {
            return Err("failed to connect to target through SOCKS5".to_string());
        }

        // Minimal HTTP exchange through the tunnel
        let http_request = format!(
            "GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.test_host
        );
        stream
            .write_all(http_request.as_bytes())
            .await
            .map_err(|e| format!("HTTP write failed: {}", e))?;

        let mut buf = [0u8; 1024];
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| format!("HTTP read failed: {}", e))?;
        if n == 0 {
            return Err("empty HTTP response".to_string());
        }
        if !buf[..n].starts_with(b"HTTP/") {
            return Err("invalid HTTP response".to_string());
        }
        Ok(())
    }
}
