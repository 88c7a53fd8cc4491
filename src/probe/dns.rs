//! UDP DNS resolver probe.
//!
//! Sends a single A-record query to a candidate resolver and measures the
//! round trip. Used by the DNS-rotating tunnel backend to rank resolver
//! candidates by latency.

use std::io;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use crate::backend::endpoint::DnsEndpoint;

use super::ProbeResult;

/// Probes candidate DNS resolvers with a minimal A-record query.
pub struct DnsProber {
    timeout: Duration,
    domain: String,
}

impl DnsProber {
    pub fn new(timeout: Duration, domain: impl Into<String>) -> Self {
        Self {
            timeout,
            domain: domain.into(),
        }
    }

    /// One query/response round trip against `endpoint`.
    ///
    /// Success iff a frame arrives before the timeout, is at least
    /// header-sized, and has the QR bit set.
    pub async fn probe(&self, endpoint: &DnsEndpoint) -> ProbeResult<DnsEndpoint> {
        debug!("Sending DNS query for {} to {}", self.domain, endpoint);
        let started = Instant::now();

        match timeout(self.timeout, self.query(endpoint)).await {
            Ok(Ok(())) => {
                let latency = started.elapsed().as_millis() as i64;
                debug!("DNS query to {} successful, latency: {}ms", endpoint, latency);
                ProbeResult::success(endpoint.clone(), latency)
            }
            Ok(Err(e)) => {
                debug!("DNS query error for {}: {}", endpoint, e);
                ProbeResult::failure(endpoint.clone(), e.to_string())
            }
            Err(_) => {
                debug!("DNS query timeout for {}", endpoint);
                ProbeResult::failure(
                    endpoint.clone(),
                    format!("timeout after {}ms", self.timeout.as_millis()),
                )
            }
        }
    }

    async fn query(&self, endpoint: &DnsEndpoint) -> io::Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((endpoint.ip.as_str(), endpoint.port)).await?;

        let query = build_query(&self.domain);
        socket.send(&query).await?;

        let mut buf = [0u8; 512];
        let n = socket.recv(&mut buf).await?;

        if !is_response(&buf[..n]) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid DNS response",
            ));
        }
        Ok(())
    }
}

/// Minimal query: 12-byte header, QNAME as length-prefixed labels,
/// QTYPE=A, QCLASS=IN.
fn build_query(domain: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(17 + domain.len());

    let transaction_id: u16 = rand::thread_rng().gen();
    buf.extend_from_slice(&transaction_id.to_be_bytes());
    // flags: standard query, recursion desired
    buf.extend_from_slice(&0x0100u16.to_be_bytes());
    // QDCOUNT=1, ANCOUNT/NSCOUNT/ARCOUNT=0
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());

    for label in domain.split('.') {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);

    // QTYPE=A, QCLASS=IN
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf
}

/// A frame counts as a response when it carries at least a full header and
/// the QR bit is set.
fn is_response(data: &[u8]) -> bool {
    data.len() >= 12 && data[2] & 0x80 != 0
}
