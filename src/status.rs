//! HTTP status endpoint.
//!
//! A single `GET /status` route reporting the selected backend, how long it
//! has been selected, and the latest probe result per backend.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::config::StatusConfig;
use crate::error::Result;
use crate::health::HealthChecker;

#[derive(Clone)]
struct AppState {
    health: Arc<HealthChecker>,
    listen_host: String,
    listen_port: u16,
}

pub struct StatusServer {
    config: StatusConfig,
    state: AppState,
}

impl StatusServer {
    pub fn new(
        config: StatusConfig,
        health: Arc<HealthChecker>,
        listen_host: String,
        listen_port: u16,
    ) -> Self {
        Self {
            config,
            state: AppState {
                health,
                listen_host,
                listen_port,
            },
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let app = Router::new()
            .route("/status", get(status))
            .with_state(self.state);

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Status endpoint at http://{}/status", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|v| *v).await;
            })
            .await?;
        info!("Status server stopping");
        Ok(())
    }
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let selection = state.health.selection();

    let (selected_backend, selected_since, selected_duration_seconds) = match &selection {
        Some(selection) => (
            json!(selection.client.name()),
            json!(selection.since.to_rfc3339()),
            json!((Utc::now() - selection.since).num_seconds()),
        ),
        None => (Value::Null, Value::Null, Value::Null),
    };

    let mut backend_latencies = serde_json::Map::new();
    for (name, result) in state.health.last_results() {
        let entry = if result.success {
            json!({"success": true, "latency_ms": result.latency_ms})
        } else {
            json!({"success": false, "error": result.error})
        };
        backend_latencies.insert(name, entry);
    }

    Json(json!({
        "selected_backend": selected_backend,
        "selected_since": selected_since,
        "selected_duration_seconds": selected_duration_seconds,
        "listen_host": state.listen_host,
        "listen_port": state.listen_port,
        "backend_latencies": backend_latencies,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::direct::DirectBackend;
    use crate::health::HealthCheckerConfig;
    use crate::probe::SocksProber;
    use std::time::Duration;

    fn state() -> AppState {
        AppState {
            health: Arc::new(HealthChecker::new(
                Vec::new(),
                HealthCheckerConfig::default(),
                SocksProber::new(Duration::from_secs(1), "http://test.example").unwrap(),
            )),
            listen_host: "127.0.0.1".to_string(),
            listen_port: 1080,
        }
    }

    #[tokio::test]
    async fn test_status_without_selection() {
        let Json(body) = status(State(state())).await;
        assert!(body["selected_backend"].is_null());
        assert!(body["selected_since"].is_null());
        assert_eq!(body["listen_port"], 1080);
        assert_eq!(body["backend_latencies"], json!({}));
    }

    #[tokio::test]
    async fn test_status_with_selection() {
        let state = state();
        let descriptor: crate::backend::BackendDescriptor = serde_json::from_value(json!({
            "type": "direct",
            "name": "b1",
            "params": {"host": "10.0.0.1", "port": 1080},
        }))
        .unwrap();
        state
            .health
            .switch_to(Arc::new(DirectBackend::new(&descriptor).unwrap()));

        let Json(body) = status(State(state)).await;
        assert_eq!(body["selected_backend"], "b1");
        assert!(body["selected_since"].is_string());
        assert!(body["selected_duration_seconds"].as_i64().unwrap() >= 0);
    }
}
