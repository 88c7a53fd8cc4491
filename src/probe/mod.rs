//! Connectivity probes used to rank backends.
//!
//! Both probes share one result type: a probe never fails with an error,
//! it yields a failure-kind [`ProbeResult`] carrying a human-readable
//! message instead.

mod dns;
mod socks;

pub use dns::DnsProber;
pub use socks::SocksProber;

/// Outcome of a single probe against `target`.
///
/// Generic over the endpoint type so DNS resolver probes and SOCKS5 backend
/// probes report through the same shape.
#[derive(Debug, Clone)]
pub struct ProbeResult<T> {
    pub target: T,
    pub success: bool,
    /// Wall-clock round-trip in milliseconds; -1 on failure.
    pub latency_ms: i64,
    pub error: Option<String>,
}

impl<T> ProbeResult<T> {
    pub fn success(target: T, latency_ms: i64) -> Self {
        Self {
            target,
            success: true,
            latency_ms,
            error: None,
        }
    }

    pub fn failure(target: T, error: impl Into<String>) -> Self {
        Self {
            target,
            success: false,
            latency_ms: -1,
            error: Some(error.into()),
        }
    }
}
