//! Backend lifecycle management and health-driven selection.
//!
//! The checker owns every backend: it constructs them from descriptors,
//! starts them with retries, probes them on two cadences (a full sweep of
//! all backends and a faster check of the active one), and publishes the
//! fastest healthy backend through an [`ArcSwapOption`] the forwarding
//! server reads lock-free on every connection.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backend::endpoint::Endpoint;
use crate::backend::{create_backend, BackendClient, BackendDescriptor};
use crate::probe::{ProbeResult, SocksProber};

const START_ATTEMPTS: u32 = 3;
const START_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Upper bound on one startup sweep across all backends.
const STARTUP_ROUND_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    /// Cadence of the full sweep over every backend.
    pub check_interval: Duration,
    /// Cadence of the lightweight check of the selected backend.
    pub current_check_interval: Duration,
    /// Concurrency of the startup phase of a sweep.
    pub workers: usize,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            current_check_interval: Duration::from_secs(10),
            workers: 5,
        }
    }
}

/// The currently selected backend and when it was adopted.
pub struct Selection {
    pub client: Arc<dyn BackendClient>,
    pub since: DateTime<Utc>,
}

pub struct HealthChecker {
    descriptors: Vec<BackendDescriptor>,
    config: HealthCheckerConfig,
    prober: SocksProber,
    /// One slot per descriptor name. `None` records a construction failure,
    /// which is permanent: the descriptor is never retried.
    clients: DashMap<String, Option<Arc<dyn BackendClient>>>,
    selected: ArcSwapOption<Selection>,
    last_results: DashMap<String, ProbeResult<Endpoint>>,
}

impl HealthChecker {
    pub fn new(
        descriptors: Vec<BackendDescriptor>,
        config: HealthCheckerConfig,
        prober: SocksProber,
    ) -> Self {
        let enabled: Vec<BackendDescriptor> = descriptors
            .into_iter()
            .filter(|d| {
                if !d.enabled {
                    info!("Backend {} is disabled, skipping", d.name);
                }
                d.enabled
            })
            .collect();

        Self {
            descriptors: enabled,
            config,
            prober,
            clients: DashMap::new(),
            selected: ArcSwapOption::const_empty(),
            last_results: DashMap::new(),
        }
    }

    /// Drive the two check cadences until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Health checker starting with {} backends",
            self.descriptors.len()
        );
        self.check_all().await;

        let mut full_tick = interval_at(
            Instant::now() + self.config.check_interval,
            self.config.check_interval,
        );
        let mut current_tick = interval_at(
            Instant::now() + self.config.current_check_interval,
            self.config.current_check_interval,
        );
        full_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        current_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = full_tick.tick() => {
                    self.check_all().await;
                }
                _ = current_tick.tick() => {
                    self.check_current().await;
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Health checker stopping");
    }

    /// Stop every backend and drop the selection.
    pub async fn shutdown(&self) {
        self.selected.store(None);
        let clients: Vec<Arc<dyn BackendClient>> = self
            .clients
            .iter()
            .filter_map(|entry| entry.value().clone())
            .collect();
        for client in clients {
            client.stop().await;
        }
        self.clients.clear();
    }

    pub fn selection(&self) -> Option<Arc<Selection>> {
        self.selected.load_full()
    }

    pub fn selected_endpoint(&self) -> Option<Endpoint> {
        self.selection().and_then(|s| s.client.endpoint())
    }

    pub fn last_results(&self) -> Vec<(String, ProbeResult<Endpoint>)> {
        self.last_results
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Full sweep: start what needs starting, probe everything, reselect.
    async fn check_all(&self) {
        let results = self.test_backends().await;

        let best = best_of(&results);
        let current = self.selection();

        match (best, current) {
            (None, Some(current)) => {
                // a sweep with no successes leaves the selection alone;
                // the current-check cadence deals with a dead incumbent
                warn!(
                    "No healthy backend available, keeping {}",
                    current.client.name()
                );
            }
            (None, None) => {
                warn!("No healthy backend available");
            }
            (Some((client, result)), None) => {
                info!(
                    "Selected backend {} ({}ms)",
                    client.name(),
                    result.latency_ms
                );
                self.switch_to(Arc::clone(client));
            }
            (Some((client, result)), Some(current)) => {
                if client.name() == current.client.name() {
                    debug!(
                        "Keeping backend {} ({}ms)",
                        client.name(),
                        result.latency_ms
                    );
                    return;
                }
                // switch only on a strict improvement over the incumbent's
                // own result this round
                let incumbent_latency = results
                    .iter()
                    .find(|(c, _)| c.name() == current.client.name())
                    .filter(|(_, r)| r.success)
                    .map(|(_, r)| r.latency_ms);
                match incumbent_latency {
                    Some(latency) if result.latency_ms >= latency => {
                        debug!(
                            "Keeping backend {} ({}ms <= {}ms)",
                            current.client.name(),
                            latency,
                            result.latency_ms
                        );
                    }
                    _ => {
                        info!(
                            "Switching backend {} -> {} ({}ms)",
                            current.client.name(),
                            client.name(),
                            result.latency_ms
                        );
                        self.switch_to(Arc::clone(client));
                    }
                }
            }
        }
    }

    /// Lightweight check of the selected backend between full sweeps.
    async fn check_current(&self) {
        let Some(selection) = self.selection() else {
            self.check_all().await;
            return;
        };
        let client = Arc::clone(&selection.client);

        if !client.is_healthy() {
            warn!("Selected backend {} is unhealthy", client.name());
            if client.rotate().await {
                info!("Backend {} rotated to an alternative path", client.name());
            } else {
                self.check_all().await;
            }
            return;
        }

        let Some(endpoint) = client.endpoint() else {
            self.check_all().await;
            return;
        };
        let result = self.prober.probe(&endpoint).await;
        let success = result.success;
        self.last_results.insert(client.name().to_string(), result);

        if success {
            debug!("Selected backend {} still healthy", client.name());
        } else {
            warn!("Selected backend {} failed its probe", client.name());
            if client.rotate().await {
                info!("Backend {} rotated to an alternative path", client.name());
            } else {
                self.check_all().await;
            }
        }
    }

    /// Start-and-probe round over every descriptor.
    ///
    /// Startup runs concurrently under the worker limit; probing runs
    /// sequentially in descriptor order so results and logs stay stable.
    async fn test_backends(&self) -> Vec<(Arc<dyn BackendClient>, ProbeResult<Endpoint>)> {
        let startup = stream::iter(self.descriptors.iter())
            .for_each_concurrent(self.config.workers, |descriptor| async {
                self.ensure_started(descriptor).await;
            });
        if timeout(STARTUP_ROUND_TIMEOUT, startup).await.is_err() {
            error!("Backend startup round timed out");
        }

        let mut results = Vec::new();
        for descriptor in &self.descriptors {
            let client = self
                .clients
                .get(&descriptor.name)
                .and_then(|entry| entry.value().clone());
            let Some(client) = client else { continue };
            if !client.is_running() {
                continue;
            }
            let Some(endpoint) = client.endpoint() else {
                continue;
            };

            let mut result = self.prober.probe(&endpoint).await;
            if !result.success && client.rotate().await {
                // one retest through the rotated path
                if let Some(endpoint) = client.endpoint() {
                    result = self.prober.probe(&endpoint).await;
                }
            }
            self.last_results
                .insert(client.name().to_string(), result.clone());
            results.push((client, result));
        }
        results
    }

    /// Construct the backend on first sight and start it with retries.
    ///
    /// Construction failures are recorded as a permanent `None`; start
    /// failures are retried here and again on the next sweep.
    async fn ensure_started(&self, descriptor: &BackendDescriptor) {
        let client = self
            .clients
            .entry(descriptor.name.clone())
            .or_insert_with(|| match create_backend(descriptor) {
                Ok(client) => Some(client),
                Err(e) => {
                    error!("Backend {} cannot be created: {}", descriptor.name, e);
                    None
                }
            })
            .value()
            .clone();

        let Some(client) = client else { return };
        if client.is_running() {
            return;
        }

        for attempt in 1..=START_ATTEMPTS {
            match client.start().await {
                Ok(()) => return,
                Err(e) => {
                    warn!(
                        "Backend {} start attempt {}/{} failed: {}",
                        client.name(),
                        attempt,
                        START_ATTEMPTS,
                        e
                    );
                    if attempt < START_ATTEMPTS {
                        tokio::time::sleep(START_RETRY_DELAY).await;
                    }
                }
            }
        }
        error!(
            "Backend {} failed to start after {} attempts",
            client.name(),
            START_ATTEMPTS
        );
    }

    pub(crate) fn switch_to(&self, client: Arc<dyn BackendClient>) {
        self.selected.store(Some(Arc::new(Selection {
            client,
            since: Utc::now(),
        })));
    }
}

/// Fastest successful result; on equal latency the earlier entry wins.
fn best_of<'a>(
    results: &'a [(Arc<dyn BackendClient>, ProbeResult<Endpoint>)],
) -> Option<(&'a Arc<dyn BackendClient>, &'a ProbeResult<Endpoint>)> {
    let mut best: Option<(&Arc<dyn BackendClient>, &ProbeResult<Endpoint>)> = None;
    for (client, result) in results {
        if !result.success {
            continue;
        }
        match best {
            Some((_, current)) if result.latency_ms >= current.latency_ms => {}
            _ => best = Some((client, result)),
        }
    }
    best
}
