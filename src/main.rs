use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use sockslb::config::LogConfig;
use sockslb::health::{HealthChecker, HealthCheckerConfig};
use sockslb::probe::SocksProber;
use sockslb::server::ForwardingServer;
use sockslb::status::StatusServer;
use sockslb::Config;

#[tokio::main]
async fn main() -> sockslb::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());
    let config = Config::load(&config_path)?;
    init_tracing(&config.log);
    info!("Starting sockslb with config {}", config_path);

    let prober = SocksProber::new(
        Duration::from_millis(config.health.probe_timeout_ms),
        &config.health.test_url,
    )?;
    let health = Arc::new(HealthChecker::new(
        config.backends.clone(),
        HealthCheckerConfig {
            check_interval: Duration::from_secs(config.health.check_interval_seconds),
            current_check_interval: Duration::from_secs(
                config.health.current_check_interval_seconds,
            ),
            workers: config.health.workers,
        },
        prober,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health_task = {
        let health = Arc::clone(&health);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { health.run(shutdown).await })
    };

    let server_task = {
        let server = ForwardingServer::new(config.listen.clone(), Arc::clone(&health));
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(shutdown).await {
                error!("Forwarding server failed: {}", e);
            }
        })
    };

    let status_task = if config.status.enabled {
        let server = StatusServer::new(
            config.status.clone(),
            Arc::clone(&health),
            config.listen.host.clone(),
            config.listen.port,
        );
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = server.run(shutdown).await {
                error!("Status server failed: {}", e);
            }
        }))
    } else {
        None
    };

    shutdown_signal().await;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);

    let mut health_task = health_task;
    if timeout(Duration::from_secs(5), &mut health_task).await.is_err() {
        health_task.abort();
    }
    let _ = server_task.await;
    if let Some(task) = status_task {
        let _ = task.await;
    }
    health.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sockslb={}", config.level)));

    if config.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
