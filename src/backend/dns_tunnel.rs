//! Tunnel backend that rotates across candidate DNS resolvers.
//!
//! Candidates come from the configuration and an optional endpoint file.
//! At startup every candidate is probed and ranked by latency; the backend
//! adopts the fastest one that yields a working tunnel. When the active
//! tunnel degrades, rotation walks the remaining ranked candidates in order
//! and gives up once they are exhausted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{BalancerError, Result};
use crate::net::NetworkMonitor;
use crate::probe::DnsProber;

use super::endpoint::{DnsEndpoint, Endpoint};
use super::tunnel::TunnelBackend;
use super::{BackendClient, BackendDescriptor};

const DEFAULT_DNS_TEST_TIMEOUT_MS: u64 = 3000;
const DEFAULT_DNS_TEST_DOMAIN: &str = "www.google.com";
const DEFAULT_MAX_DNS_RETRIES: usize = 5;

struct RotationState {
    /// Ranked by probe latency, fastest first.
    candidates: Vec<DnsEndpoint>,
    /// Index of the resolver behind the active tunnel.
    current: usize,
}

pub struct DnsRotatingBackend {
    name: String,
    descriptor: BackendDescriptor,
    prober: DnsProber,
    max_retries: usize,
    monitor: Option<NetworkMonitor>,
    running: AtomicBool,
    // rotation and startup serialize on this lock; it is the only writer of
    // `inner` and `state`
    state: Mutex<RotationState>,
    inner: RwLock<Option<Arc<TunnelBackend>>>,
}

impl DnsRotatingBackend {
    pub fn new(descriptor: &BackendDescriptor) -> Result<Self> {
        // the tunnel parameters must be present up front so a bad descriptor
        // fails once instead of on every rotation
        descriptor.require_str("binary_path")?;
        descriptor.require_str("domain")?;
        descriptor.require_str("cert_path")?;
        descriptor.require_port("port")?;

        let timeout = Duration::from_millis(
            descriptor
                .int_param("dns_test_timeout_ms")
                .and_then(|v| u64::try_from(v).ok())
                .unwrap_or(DEFAULT_DNS_TEST_TIMEOUT_MS),
        );
        let domain = descriptor
            .str_param("dns_test_domain")
            .unwrap_or(DEFAULT_DNS_TEST_DOMAIN)
            .to_string();
        let max_retries = descriptor
            .int_param("max_dns_retries")
            .and_then(|v| usize::try_from(v).ok())
            .unwrap_or(DEFAULT_MAX_DNS_RETRIES);
        let monitor = if descriptor.bool_param("check_network").unwrap_or(true) {
            let interface = descriptor.str_param("network_interface").map(str::to_string);
            Some(NetworkMonitor::new(interface))
        } else {
            None
        };

        Ok(Self {
            name: descriptor.name.clone(),
            descriptor: descriptor.clone(),
            prober: DnsProber::new(timeout, domain),
            max_retries,
            monitor,
            running: AtomicBool::new(false),
            state: Mutex::new(RotationState {
                candidates: Vec::new(),
                current: 0,
            }),
            inner: RwLock::new(None),
        })
    }

    /// Inline `dns_endpoints` entries plus the lines of
    /// `dns_endpoints_file`, in that order. Invalid entries are logged and
    /// skipped.
    async fn load_candidates(&self) -> Result<Vec<DnsEndpoint>> {
        let mut raw: Vec<String> = self.descriptor.str_list_param("dns_endpoints")?;

        if let Some(path) = self.descriptor.str_param("dns_endpoints_file") {
            let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
                BalancerError::InvalidConfig(format!(
                    "backend {}: cannot read {}: {}",
                    self.name, path, e
                ))
            })?;
            raw.extend(contents.lines().map(str::to_string));
        }

        let mut candidates = Vec::new();
        for entry in raw {
            let entry = entry.trim();
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }
            match entry.parse::<DnsEndpoint>() {
                Ok(endpoint) => candidates.push(endpoint),
                Err(e) => warn!("Backend {}: skipping DNS endpoint: {}", self.name, e),
            }
        }
        Ok(candidates)
    }

    /// Probe every candidate and return the working ones sorted by latency.
    async fn rank_candidates(&self, candidates: &[DnsEndpoint]) -> Vec<DnsEndpoint> {
        info!(
            "Backend {}: testing {} DNS endpoints",
            self.name,
            candidates.len()
        );

        let mut ranked = Vec::new();
        for (i, candidate) in candidates.iter().enumerate() {
            if i > 0 && i % 10 == 0 {
                info!(
                    "Backend {}: tested {}/{} DNS endpoints",
                    self.name,
                    i,
                    candidates.len()
                );
            }
            let result = self.prober.probe(candidate).await;
            if result.success {
                ranked.push((result.latency_ms, candidate.clone()));
            }
        }

        ranked.sort_by_key(|(latency, _)| *latency);
        info!(
            "Backend {}: {} working DNS endpoints:",
            self.name,
            ranked.len()
        );
        for (latency, endpoint) in &ranked {
            info!("  {} - {}ms", endpoint, latency);
        }
        ranked.into_iter().map(|(_, endpoint)| endpoint).collect()
    }

    /// Build and start a tunnel through `resolver`. The tunnel is discarded
    /// on failure.
    async fn start_inner(&self, resolver: &DnsEndpoint) -> Result<Arc<TunnelBackend>> {
        let tunnel = Arc::new(TunnelBackend::with_resolver(&self.descriptor, resolver)?);
        match tunnel.start().await {
            Ok(()) => Ok(tunnel),
            Err(e) => {
                tunnel.stop().await;
                Err(e)
            }
        }
    }

    async fn stop_inner(&self) {
        let inner = self.inner.write().take();
        if let Some(tunnel) = inner {
            tunnel.stop().await;
        }
    }

    fn adopt(&self, tunnel: Arc<TunnelBackend>) {
        *self.inner.write() = Some(tunnel);
    }

    fn active_tunnel(&self) -> Option<Arc<TunnelBackend>> {
        self.inner.read().clone()
    }
}

#[async_trait]
impl BackendClient for DnsRotatingBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn endpoint(&self) -> Option<Endpoint> {
        self.active_tunnel().and_then(|t| t.endpoint())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_healthy(&self) -> bool {
        self.is_running()
            && self
                .active_tunnel()
                .map(|t| t.is_healthy())
                .unwrap_or(false)
    }

    async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if self.is_running() {
            warn!("Backend {} is already running", self.name);
            return Ok(());
        }

        let candidates = self.load_candidates().await?;
        if candidates.is_empty() {
            return Err(BalancerError::InvalidConfig(format!(
                "backend {}: no DNS endpoints configured",
                self.name
            )));
        }

        let ranked = self.rank_candidates(&candidates).await;
        if ranked.is_empty() {
            return Err(BalancerError::Startup(format!(
                "{}: no working DNS endpoint found",
                self.name
            )));
        }

        let attempts = self.max_retries.min(ranked.len());
        for index in 0..attempts {
            let resolver = &ranked[index];
            match self.start_inner(resolver).await {
                Ok(tunnel) => {
                    info!("Backend {} up via resolver {}", self.name, resolver);
                    self.adopt(tunnel);
                    state.candidates = ranked;
                    state.current = index;
                    self.running.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Backend {}: tunnel via {} failed to start: {}",
                        self.name, resolver, e
                    );
                }
            }
        }

        Err(BalancerError::Startup(format!(
            "{}: all {} ranked DNS endpoints failed to start a tunnel",
            self.name, attempts
        )))
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_inner().await;
    }

    /// Move to the next ranked resolver. Returns false, and marks the
    /// backend stopped, when the candidates are exhausted.
    async fn rotate(&self) -> bool {
        if let Some(monitor) = &self.monitor {
            if !monitor.is_available() {
                warn!(
                    "Backend {}: network unavailable, skipping rotation",
                    self.name
                );
                return false;
            }
        }

        let mut state = self.state.lock().await;
        let len = state.candidates.len();
        if len == 0 {
            debug!("Backend {}: nothing to rotate to", self.name);
            self.running.store(false, Ordering::SeqCst);
            return false;
        }

        let next = state.current + 1;
        let max_attempts = self.max_retries.min(len.saturating_sub(next));
        for attempt in 0..max_attempts {
            let try_index = (next + attempt) % len;
            let resolver = state.candidates[try_index].clone();
            info!(
                "Backend {}: rotating to resolver {} ({}/{})",
                self.name,
                resolver,
                attempt + 1,
                max_attempts
            );

            self.stop_inner().await;
            match self.start_inner(&resolver).await {
                Ok(tunnel) => {
                    tunnel.reset_health();
                    self.adopt(tunnel);
                    state.current = try_index;
                    info!("Backend {} rotated to resolver {}", self.name, resolver);
                    return true;
                }
                Err(e) => {
                    warn!(
                        "Backend {}: rotation to {} failed: {}",
                        self.name, resolver, e
                    );
                }
            }
        }

        warn!("Backend {}: DNS endpoints exhausted, giving up", self.name);
        self.stop_inner().await;
        self.running.store(false, Ordering::SeqCst);
        false
    }
}
