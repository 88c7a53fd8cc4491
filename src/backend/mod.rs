//! Backend abstraction and the four concrete backend kinds.
//!
//! A backend is anything that exposes a SOCKS5 endpoint once running: a
//! remote proxy that is simply there ([`direct`]), a locally spawned proxy
//! process ([`process`]), a DNS tunnel client ([`tunnel`]), and a tunnel that
//! rotates across candidate resolvers when its link degrades
//! ([`dns_tunnel`]).

pub mod direct;
pub mod dns_tunnel;
pub mod endpoint;
pub mod process;
pub mod tunnel;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{BalancerError, Result};

use self::direct::DirectBackend;
use self::dns_tunnel::DnsRotatingBackend;
use self::endpoint::Endpoint;
use self::process::ProcessBackend;
use self::tunnel::TunnelBackend;

/// One backend entry from the configuration file.
///
/// `params` carries the kind-specific settings; each backend pulls what it
/// needs through the typed accessors below and rejects what is missing at
/// construction time.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

fn default_enabled() -> bool {
    true
}

impl BackendDescriptor {
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn int_param(&self, key: &str) -> Option<i64> {
        self.params.get(key).and_then(Value::as_i64)
    }

    pub fn bool_param(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(Value::as_bool)
    }

    /// String list parameter; a missing key is an empty list, a present key
    /// with the wrong shape is a configuration error.
    pub fn str_list_param(&self, key: &str) -> Result<Vec<String>> {
        match self.params.get(key) {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        BalancerError::InvalidConfig(format!(
                            "backend {}: {} must be a list of strings",
                            self.name, key
                        ))
                    })
                })
                .collect(),
            Some(_) => Err(BalancerError::InvalidConfig(format!(
                "backend {}: {} must be a list of strings",
                self.name, key
            ))),
        }
    }

    /// String map parameter; a missing key is an empty map, a present key
    /// with the wrong shape is a configuration error.
    pub fn str_map_param(&self, key: &str) -> Result<Vec<(String, String)>> {
        match self.params.get(key) {
            None => Ok(Vec::new()),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| {
                    v.as_str().map(|s| (k.clone(), s.to_string())).ok_or_else(|| {
                        BalancerError::InvalidConfig(format!(
                            "backend {}: {} must map strings to strings",
                            self.name, key
                        ))
                    })
                })
                .collect(),
            Some(_) => Err(BalancerError::InvalidConfig(format!(
                "backend {}: {} must be an object of strings",
                self.name, key
            ))),
        }
    }

    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.str_param(key).ok_or_else(|| {
            BalancerError::InvalidConfig(format!(
                "backend {}: missing required parameter {}",
                self.name, key
            ))
        })
    }

    pub fn port_param(&self, key: &str) -> Result<Option<u16>> {
        match self.int_param(key) {
            None => Ok(None),
            Some(value) => u16::try_from(value).map(Some).map_err(|_| {
                BalancerError::InvalidConfig(format!(
                    "backend {}: {} is not a valid port: {}",
                    self.name, key, value
                ))
            }),
        }
    }

    pub fn require_port(&self, key: &str) -> Result<u16> {
        self.port_param(key)?.ok_or_else(|| {
            BalancerError::InvalidConfig(format!(
                "backend {}: missing required parameter {}",
                self.name, key
            ))
        })
    }
}

/// A managed SOCKS5 backend.
///
/// Implementations are shared behind `Arc` between the health checker and
/// the forwarding server, so every method takes `&self` and state lives in
/// interior-mutable fields.
#[async_trait]
pub trait BackendClient: Send + Sync {
    fn name(&self) -> &str;

    /// Where the SOCKS5 listener is, once the backend has started.
    fn endpoint(&self) -> Option<Endpoint>;

    fn is_running(&self) -> bool;

    /// Running and not known-degraded. For most kinds this is the same as
    /// [`is_running`](Self::is_running).
    fn is_healthy(&self) -> bool;

    /// Bring the backend up. Must be idempotent while running.
    async fn start(&self) -> Result<()>;

    /// Tear the backend down. Never fails; problems are logged.
    async fn stop(&self);

    /// Switch to an alternative underlying path, where the kind supports
    /// one. Returns whether a usable alternative was adopted.
    async fn rotate(&self) -> bool {
        false
    }
}

/// Construct a backend from its descriptor. Fails on an unknown kind or on
/// invalid parameters; such failures are permanent for the descriptor.
pub fn create_backend(descriptor: &BackendDescriptor) -> Result<Arc<dyn BackendClient>> {
    match descriptor.kind.to_lowercase().as_str() {
        "direct" => Ok(Arc::new(DirectBackend::new(descriptor)?)),
        "process" => Ok(Arc::new(ProcessBackend::new(descriptor)?)),
        "tunnel" => Ok(Arc::new(TunnelBackend::new(descriptor)?)),
        "dns_tunnel" | "dns-tunnel" => Ok(Arc::new(DnsRotatingBackend::new(descriptor)?)),
        other => Err(BalancerError::UnknownBackendType(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor(kind: &str, params: Value) -> BackendDescriptor {
        serde_json::from_value(json!({
            "type": kind,
            "name": "test",
            "params": params,
        }))
        .unwrap()
    }

    #[test]
    fn test_descriptor_defaults() {
        let d: BackendDescriptor =
            serde_json::from_value(json!({"type": "direct", "name": "d1"})).unwrap();
        assert!(d.enabled);
        assert!(d.params.is_empty());
    }

    #[test]
    fn test_typed_params() {
        let d = descriptor(
            "direct",
            json!({"host": "10.0.0.1", "port": 1080, "verbose": true}),
        );
        assert_eq!(d.str_param("host"), Some("10.0.0.1"));
        assert_eq!(d.require_port("port").unwrap(), 1080);
        assert_eq!(d.bool_param("verbose"), Some(true));
        assert!(d.require_str("missing").is_err());
    }

    #[test]
    fn test_port_param_out_of_range() {
        let d = descriptor("direct", json!({"port": 123456}));
        assert!(d.port_param("port").is_err());
    }

    #[test]
    fn test_str_list_param() {
        let d = descriptor("process", json!({"args": ["-l", "1080"], "bad": "notalist"}));
        assert_eq!(d.str_list_param("args").unwrap(), vec!["-l", "1080"]);
        assert!(d.str_list_param("missing").unwrap().is_empty());
        assert!(d.str_list_param("bad").is_err());
    }

    #[test]
    fn test_str_map_param() {
        let d = descriptor("process", json!({"env": {"KEY": "value"}, "bad": [1]}));
        assert_eq!(
            d.str_map_param("env").unwrap(),
            vec![("KEY".to_string(), "value".to_string())]
        );
        assert!(d.str_map_param("missing").unwrap().is_empty());
        assert!(d.str_map_param("bad").is_err());
    }

    #[test]
    fn test_create_backend_unknown_kind() {
        let d = descriptor("ftp", json!({}));
        let Err(err) = create_backend(&d) else {
            panic!("unknown backend kind must be rejected")
        };
        assert!(matches!(err, BalancerError::UnknownBackendType(_)));
    }

    #[test]
    fn test_create_backend_direct() {
        let d = descriptor("DIRECT", json!({"host": "127.0.0.1", "port": 1080}));
        let backend = create_backend(&d).unwrap();
        assert_eq!(backend.name(), "test");
        assert!(!backend.is_running());
    }
}
