//! JSON configuration file loading and validation.

use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::backend::BackendDescriptor;
use crate::error::{BalancerError, Result};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub backends: Vec<BackendDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    #[serde(default = "default_listen_host")]
    pub host: String,
    #[serde(default = "default_listen_port")]
    pub port: u16,
    /// SO_RCVBUF for the listener and backend sockets, in bytes.
    #[serde(default)]
    pub so_rcvbuf: Option<u32>,
    /// SO_SNDBUF for the listener and backend sockets, in bytes.
    #[serde(default)]
    pub so_sndbuf: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
    #[serde(default = "default_current_check_interval")]
    pub current_check_interval_seconds: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    /// Target reached through each backend to validate the full path.
    #[serde(default = "default_test_url")]
    pub test_url: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_listen_host")]
    pub host: String,
    #[serde(default = "default_status_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    1080
}

fn default_check_interval() -> u64 {
    30
}

fn default_current_check_interval() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    5000
}

fn default_test_url() -> String {
    "http://www.google.com".to_string()
}

fn default_workers() -> usize {
    5
}

fn default_status_port() -> u16 {
    9080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_listen_host(),
            port: default_listen_port(),
            so_rcvbuf: None,
            so_sndbuf: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: default_check_interval(),
            current_check_interval_seconds: default_current_check_interval(),
            probe_timeout_ms: default_probe_timeout(),
            test_url: default_test_url(),
            workers: default_workers(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_listen_host(),
            port: default_status_port(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ListenConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Config {
    /// Load from a JSON file. A missing file yields the defaults; a present
    /// but invalid file is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.health.check_interval_seconds == 0
            || self.health.current_check_interval_seconds == 0
        {
            return Err(BalancerError::InvalidConfig(
                "health check intervals must be positive".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            if backend.name.trim().is_empty() {
                return Err(BalancerError::InvalidConfig(
                    "backend with empty name".to_string(),
                ));
            }
            if !seen.insert(backend.name.as_str()) {
                return Err(BalancerError::InvalidConfig(format!(
                    "duplicate backend name: {}",
                    backend.name
                )));
            }
        }
        Ok(())
    }
}
