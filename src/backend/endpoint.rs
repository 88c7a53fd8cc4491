//! Endpoint value types shared by backends and resolver candidates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BalancerError;

/// TCP endpoint of a backend SOCKS5 proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form suitable for connecting.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// UDP endpoint of a candidate DNS resolver.
///
/// Same shape as [`Endpoint`] but kept distinct: resolvers are probed over
/// UDP and never forwarded to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DnsEndpoint {
    pub ip: String,
    pub port: u16,
}

impl DnsEndpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl fmt::Display for DnsEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for DnsEndpoint {
    type Err = BalancerError;

    /// Parses `ip` or `ip:port`; the port defaults to 53.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(BalancerError::InvalidConfig(
                "empty DNS endpoint".to_string(),
            ));
        }

        match s.rsplit_once(':') {
            Some((ip, port_str)) => {
                let port = port_str.parse::<u16>().map_err(|_| {
                    BalancerError::InvalidConfig(format!("invalid DNS endpoint port: {}", s))
                })?;
                if ip.is_empty() {
                    return Err(BalancerError::InvalidConfig(format!(
                        "invalid DNS endpoint: {}",
                        s
                    )));
                }
                Ok(Self::new(ip, port))
            }
            None => Ok(Self::new(s, 53)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        let endpoint = Endpoint::new("127.0.0.1", 1080);
        assert_eq!(endpoint.to_string(), "127.0.0.1:1080");
        assert_eq!(endpoint.authority(), "127.0.0.1:1080");
    }

    #[test]
    fn test_dns_endpoint_parse_with_port() {
        let endpoint: DnsEndpoint = "1.1.1.1:5353".parse().unwrap();
        assert_eq!(endpoint.ip, "1.1.1.1");
        assert_eq!(endpoint.port, 5353);
    }

    #[test]
    fn test_dns_endpoint_parse_default_port() {
        let endpoint: DnsEndpoint = "8.8.8.8".parse().unwrap();
        assert_eq!(endpoint.ip, "8.8.8.8");
        assert_eq!(endpoint.port, 53);
    }

    #[test]
    fn test_dns_endpoint_parse_trims_whitespace() {
        let endpoint: DnsEndpoint = "  9.9.9.9:53  ".parse().unwrap();
        assert_eq!(endpoint.ip, "9.9.9.9");
    }

    #[test]
    fn test_dns_endpoint_parse_invalid() {
        assert!("".parse::<DnsEndpoint>().is_err());
        assert!("1.1.1.1:notaport".parse::<DnsEndpoint>().is_err());
        assert!(":53".parse::<DnsEndpoint>().is_err());
    }
}
