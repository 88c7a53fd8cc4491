//! Transparent load balancer for SOCKS5 backends.
//!
//! A plain TCP listener fronts a set of managed SOCKS5 backends: remote
//! proxies, locally spawned proxy processes, and DNS tunnel clients that can
//! rotate across candidate resolvers. A health checker probes every backend
//! through a real SOCKS5 handshake plus HTTP request, keeps the fastest one
//! selected, and the listener splices each client connection straight
//! through to it.

pub mod backend;
pub mod config;
pub mod error;
pub mod health;
pub mod net;
pub mod probe;
pub mod server;
pub mod status;

pub use config::Config;
pub use error::{BalancerError, Result};
