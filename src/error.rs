use thiserror::Error;

/// Unified error type for the balancer.
///
/// Probe outcomes are deliberately *not* errors: both probes report
/// success/failure through [`crate::probe::ProbeResult`] so callers branch on
/// values rather than exceptions.
#[derive(Error, Debug)]
pub enum BalancerError {
    // Configuration errors (fatal at construction, never retried)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("Unknown backend type: {0}")]
    UnknownBackendType(String),

    // Backend lifecycle errors (retried with backoff by the health checker)
    #[error("Backend startup failed: {0}")]
    Startup(String),

    // Forwarding errors (scoped to a single client connection)
    #[error("Forwarding error: {0}")]
    Forward(String),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for balancer operations
pub type Result<T> = std::result::Result<T, BalancerError>;

impl BalancerError {
    /// Configuration errors abort a backend's participation permanently;
    /// everything else is either retried or scoped to one operation.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            BalancerError::InvalidConfig(_)
                | BalancerError::ConfigParse(_)
                | BalancerError::UnknownBackendType(_)
        )
    }
}
