//! Backend for an externally managed SOCKS5 proxy.
//!
//! Nothing to launch or supervise; start/stop only flip the participation
//! flag so the health checker treats it like any other backend.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::Result;

use super::endpoint::Endpoint;
use super::{BackendClient, BackendDescriptor};

pub struct DirectBackend {
    name: String,
    endpoint: Endpoint,
    running: AtomicBool,
}

impl DirectBackend {
    pub fn new(descriptor: &BackendDescriptor) -> Result<Self> {
        let host = descriptor.str_param("host").unwrap_or("127.0.0.1").to_string();
        let port = descriptor.require_port("port")?;

        Ok(Self {
            name: descriptor.name.clone(),
            endpoint: Endpoint::new(host, port),
            running: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl BackendClient for DirectBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn endpoint(&self) -> Option<Endpoint> {
        Some(self.endpoint.clone())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_healthy(&self) -> bool {
        self.is_running()
    }

    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Backend {} is already running", self.name);
            return Ok(());
        }
        info!("Backend {} ready at {}", self.name, self.endpoint);
        Ok(())
    }

    async fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Backend {} stopped", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor(params: serde_json::Value) -> BackendDescriptor {
        serde_json::from_value(json!({
            "type": "direct",
            "name": "d1",
            "params": params,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let backend = DirectBackend::new(&descriptor(json!({"host": "10.0.0.1", "port": 1080})))
            .unwrap();

        assert!(!backend.is_running());
        assert!(!backend.is_healthy());
        assert_eq!(
            backend.endpoint(),
            Some(Endpoint::new("10.0.0.1", 1080))
        );

        backend.start().await.unwrap();
        assert!(backend.is_running());
        assert!(backend.is_healthy());

        // idempotent while running
        backend.start().await.unwrap();
        assert!(backend.is_running());

        backend.stop().await;
        assert!(!backend.is_running());
    }

    #[test]
    fn test_missing_port_rejected() {
        assert!(DirectBackend::new(&descriptor(json!({"host": "10.0.0.1"}))).is_err());
    }

    #[test]
    fn test_host_defaults_to_loopback() {
        let backend = DirectBackend::new(&descriptor(json!({"port": 1080}))).unwrap();
        assert_eq!(backend.endpoint(), Some(Endpoint::new("127.0.0.1", 1080)));
    }
}
