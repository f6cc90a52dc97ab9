//! Network module for external reachability.
//!
//! This module provides:
//! - A dual-stack non-blocking listener
//! - UPnP port mapping with a public-IP fallback
//! - Best-effort host firewall rules
//! - Construction of the published URL

pub mod firewall;
pub mod listener;
pub mod nat;
pub mod public_ip;

use std::net::{IpAddr, Ipv6Addr};

use tracing::{info, warn};

use crate::access::AccessKey;

/// Address used when neither mapping nor lookup produced one.
pub const FALLBACK_ADDRESS: IpAddr = IpAddr::V6(Ipv6Addr::LOCALHOST);

/// Outcome of external address discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalAddress {
    /// Address to publish.
    pub ip: IpAddr,
    /// Whether a gateway mapping now forwards the port.
    pub mapped: bool,
}

/// Finds the address to publish for `port`.
///
/// Tries a gateway mapping first, then the public IP lookup, and finally
/// falls back to [`FALLBACK_ADDRESS`]. Never fails.
pub fn resolve_external_address(
    mapper: &dyn PortMapper,
    resolver: &dyn PublicIpResolver,
    port: u16,
) -> ExternalAddress {
    match mapper.setup_mapping(port) {
        Ok(ip) => return ExternalAddress { ip, mapped: true },
        Err(e) => {
            warn!(
                "UPnP NAT mapping failed ({}); falling back to public IP (port may not be forwarded)",
                e
            );
        }
    }

    match resolver.resolve() {
        Ok(ip) => {
            info!("Public IP lookup returned {}", ip);
            ExternalAddress { ip, mapped: false }
        }
        Err(e) => {
            warn!("Error obtaining public IP: {}; using {}", e, FALLBACK_ADDRESS);
            ExternalAddress {
                ip: FALLBACK_ADDRESS,
                mapped: false,
            }
        }
    }
}

/// Formats `http://<addr>:<port>/?key=<key>`, bracketing IPv6 literals.
pub fn format_public_url(ip: IpAddr, port: u16, key: &AccessKey) -> String {
    match ip {
        IpAddr::V4(v4) => format!("http://{}:{}/?key={}", v4, port, key),
        IpAddr::V6(v6) => format!("http://[{}]:{}/?key={}", v6, port, key),
    }
}

// Re-export key types
pub use firewall::{Firewall, FirewallError, NoopFirewall, SystemFirewall};
pub use listener::bind_dual_stack;
pub use nat::{DisabledPortMapper, IgdPortMapper, MappingError, PortMapper};
pub use public_ip::{HttpPublicIpResolver, LookupError, PublicIpResolver};
