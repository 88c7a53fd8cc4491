//! Network availability checks.
//!
//! Resolver rotation is pointless while the machine has no usable network,
//! so the rotating backend asks here before burning through candidates.

use std::net::IpAddr;

use sysinfo::Networks;
use tracing::debug;

/// Checks whether a usable network interface is up.
#[derive(Debug, Clone, Default)]
pub struct NetworkMonitor {
    /// Restrict the check to one interface by name; `None` accepts any.
    interface: Option<String>,
}

impl NetworkMonitor {
    pub fn new(interface: Option<String>) -> Self {
        Self { interface }
    }

    /// True when some interface (or the named one) carries a routable
    /// address.
    pub fn is_available(&self) -> bool {
        let networks = Networks::new_with_refreshed_list();
        for (name, data) in networks.iter() {
            if let Some(wanted) = &self.interface {
                if name != wanted {
                    continue;
                }
            }
            if data
                .ip_networks()
                .iter()
                .any(|network| is_routable(network.addr))
            {
                debug!("Network available via {}", name);
                return true;
            }
        }
        debug!("No usable network interface found");
        false
    }
}

fn is_routable(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_link_local() && !v4.is_unspecified(),
        IpAddr::V6(v6) => {
            !v6.is_loopback()
                && !v6.is_unspecified()
                // fe80::/10 link-local
                && v6.segments()[0] & 0xffc0 != 0xfe80
        }
    }
}
