//! DNS tunnel client backend.
//!
//! Wraps a tunnel client binary (slipstream-style) that exposes a local
//! SOCKS5 listener and carries traffic over DNS through a resolver. The
//! subprocess log output is watched for instability markers; a burst of
//! marked warnings flips the backend to degraded so the health checker can
//! rotate it to another resolver.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{BalancerError, Result};

use super::endpoint::{DnsEndpoint, Endpoint};
use super::process::{drain_output, terminate_child, LineHook};
use super::{BackendClient, BackendDescriptor};

const DEFAULT_STARTUP_DELAY_MS: u64 = 2000;

/// Two marked warnings within ten seconds degrade the tunnel.
const WARNING_WINDOW: Duration = Duration::from_secs(10);
const WARNING_THRESHOLD: u32 = 2;

/// Log fragments the tunnel client prints when its DNS path is failing.
const INSTABILITY_MARKERS: [&str; 4] = [
    "Connection closed",
    "reconnecting",
    "Path for resolver",
    "became unavailable",
];

/// Tracks instability warnings in the tunnel client's log output.
///
/// Lock-free: the drain task writes, the health checker reads. The counter
/// resets whenever a gap longer than [`WARNING_WINDOW`] separates two
/// warnings.
pub struct HealthMonitor {
    consecutive_warnings: AtomicU32,
    last_warning_ms: AtomicU64,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            consecutive_warnings: AtomicU32::new(0),
            last_warning_ms: AtomicU64::new(0),
        }
    }

    pub fn observe_line(&self, line: &str) {
        self.observe_line_at(line, now_ms());
    }

    fn observe_line_at(&self, line: &str, now_ms: u64) {
        if !line.contains("WARN") {
            return;
        }
        if !INSTABILITY_MARKERS.iter().any(|m| line.contains(m)) {
            return;
        }

        let last = self.last_warning_ms.swap(now_ms, Ordering::SeqCst);
        let within_window = now_ms.saturating_sub(last) <= WARNING_WINDOW.as_millis() as u64;
        let count = if last != 0 && within_window {
            self.consecutive_warnings.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.consecutive_warnings.store(1, Ordering::SeqCst);
            1
        };
        debug!("Tunnel instability warning {} within window", count);
    }

    pub fn is_degraded(&self) -> bool {
        if self.consecutive_warnings.load(Ordering::SeqCst) < WARNING_THRESHOLD {
            return false;
        }
        // stale warnings age out
        let last = self.last_warning_ms.load(Ordering::SeqCst);
        now_ms().saturating_sub(last) <= WARNING_WINDOW.as_millis() as u64
    }

    pub fn reset(&self) {
        self.consecutive_warnings.store(0, Ordering::SeqCst);
        self.last_warning_ms.store(0, Ordering::SeqCst);
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct TunnelBackend {
    name: String,
    binary: String,
    domain: String,
    cert: String,
    resolver: DnsEndpoint,
    port: u16,
    startup_delay: Duration,
    log_output: bool,
    monitor: Arc<HealthMonitor>,
    running: Arc<AtomicBool>,
    child: Mutex<Option<Child>>,
}

impl TunnelBackend {
    pub fn new(descriptor: &BackendDescriptor) -> Result<Self> {
        let binary = descriptor.require_str("binary_path")?.to_string();
        let domain = descriptor.require_str("domain")?.to_string();
        let cert = descriptor.require_str("cert_path")?.to_string();
        let port = descriptor.require_port("port")?;

        if domain.trim().is_empty() {
            return Err(BalancerError::InvalidConfig(format!(
                "backend {}: domain is empty",
                descriptor.name
            )));
        }
        validate_binary(&descriptor.name, &binary)?;
        std::fs::File::open(&cert).map_err(|e| {
            BalancerError::InvalidConfig(format!(
                "backend {}: cannot read cert {}: {}",
                descriptor.name, cert, e
            ))
        })?;

        let resolver_ip = descriptor
            .str_param("resolver_ip")
            .unwrap_or("127.0.0.1")
            .to_string();
        let resolver_port = descriptor.port_param("resolver_port")?.unwrap_or(53);
        let startup_delay = Duration::from_millis(
            descriptor
                .int_param("startup_delay_ms")
                .and_then(|v| u64::try_from(v).ok())
                .unwrap_or(DEFAULT_STARTUP_DELAY_MS),
        );
        let log_output = descriptor.bool_param("log_subprocess_output").unwrap_or(false);

        Ok(Self {
            name: descriptor.name.clone(),
            binary,
            domain,
            cert,
            resolver: DnsEndpoint::new(resolver_ip, resolver_port),
            port,
            startup_delay,
            log_output,
            monitor: Arc::new(HealthMonitor::new()),
            running: Arc::new(AtomicBool::new(false)),
            child: Mutex::new(None),
        })
    }

    /// Same descriptor, different resolver. Used by the rotating backend to
    /// build one tunnel per candidate.
    pub fn with_resolver(descriptor: &BackendDescriptor, resolver: &DnsEndpoint) -> Result<Self> {
        let mut descriptor = descriptor.clone();
        descriptor.name = format!("{}-tunnel", descriptor.name);
        descriptor
            .params
            .insert("resolver_ip".to_string(), resolver.ip.clone().into());
        descriptor
            .params
            .insert("resolver_port".to_string(), resolver.port.into());
        Self::new(&descriptor)
    }

    pub fn resolver(&self) -> &DnsEndpoint {
        &self.resolver
    }

    pub fn reset_health(&self) {
        self.monitor.reset();
    }
}

#[async_trait]
impl BackendClient for TunnelBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn endpoint(&self) -> Option<Endpoint> {
        Some(Endpoint::new("127.0.0.1", self.port))
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_healthy(&self) -> bool {
        self.is_running() && !self.monitor.is_degraded()
    }

    async fn start(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        if self.is_running() {
            warn!("Backend {} is already running", self.name);
            return Ok(());
        }

        info!(
            "Backend {} starting tunnel via resolver {}",
            self.name, self.resolver
        );
        self.monitor.reset();
        self.running.store(true, Ordering::SeqCst);

        let spawn_result = Command::new(&self.binary)
            .arg("--resolver")
            .arg(self.resolver.to_string())
            .arg("--domain")
            .arg(&self.domain)
            .arg("-l")
            .arg(self.port.to_string())
            .arg("--cert")
            .arg(&self.cert)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawn_result {
            Ok(child) => child,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(BalancerError::Startup(format!(
                    "failed to launch {}: {}",
                    self.binary, e
                )));
            }
        };

        let monitor = Arc::clone(&self.monitor);
        let hook: LineHook = Arc::new(move |line| monitor.observe_line(line));
        drain_output(
            self.name.clone(),
            "stdout",
            child.stdout.take(),
            Arc::clone(&self.running),
            Some(Arc::clone(&hook)),
            self.log_output,
        );
        drain_output(
            self.name.clone(),
            "stderr",
            child.stderr.take(),
            Arc::clone(&self.running),
            Some(hook),
            self.log_output,
        );

        tokio::time::sleep(self.startup_delay).await;
        if let Ok(Some(status)) = child.try_wait() {
            self.running.store(false, Ordering::SeqCst);
            return Err(BalancerError::Startup(format!(
                "{} exited during startup with {}",
                self.name, status
            )));
        }

        info!(
            "Backend {} tunnel up on port {} (pid {:?})",
            self.name,
            self.port,
            child.id()
        );
        *guard = Some(child);
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let child = self.child.lock().await.take();
        if let Some(child) = child {
            terminate_child(&self.name, child).await;
        }
        self.monitor.reset();
    }
}

fn validate_binary(name: &str, binary: &str) -> Result<()> {
    let metadata = std::fs::metadata(binary).map_err(|e| {
        BalancerError::InvalidConfig(format!("backend {}: binary {}: {}", name, binary, e))
    })?;
    if !metadata.is_file() {
        return Err(BalancerError::InvalidConfig(format!(
            "backend {}: binary {} is not a file",
            name, binary
        )));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(BalancerError::InvalidConfig(format!(
                "backend {}: binary {} is not executable",
                name, binary
            )));
        }
    }
    Ok(())
}
