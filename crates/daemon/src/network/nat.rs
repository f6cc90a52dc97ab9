//! UPnP IGD port mapping.
//!
//! Setup and teardown are independent calls: each one discovers the gateway
//! again, so no gateway handle outlives a call. Each call runs on its own
//! worker thread and is abandoned once its deadline passes.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use igd_next::{search_gateway, Gateway, PortMappingProtocol, SearchOptions};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::NatConfig;

/// Time allowed for the SOAP requests after discovery.
const GATEWAY_REQUEST_BUDGET: Duration = Duration::from_secs(5);

/// Errors from gateway discovery and mapping requests.
#[derive(Debug, Error)]
pub enum MappingError {
    /// No gateway answered the discovery request.
    #[error("no UPnP gateway found: {0}")]
    NoGateway(String),

    /// The gateway did not report its external address.
    #[error("gateway did not report an external address: {0}")]
    ExternalAddress(String),

    /// The gateway rejected the mapping request.
    #[error("gateway rejected port mapping: {0}")]
    AddRejected(String),

    /// The gateway rejected the removal request.
    #[error("gateway rejected mapping removal: {0}")]
    RemoveRejected(String),

    /// This host's LAN address could not be determined.
    #[error("cannot determine local address: {0}")]
    LocalAddress(#[from] io::Error),

    /// The gateway exchange did not finish in time.
    #[error("gateway did not answer within {0:?}")]
    TimedOut(Duration),

    /// The worker running the exchange could not start or died.
    #[error("gateway worker failed: {0}")]
    Worker(String),

    /// Mapping is switched off in configuration.
    #[error("port mapping disabled")]
    Disabled,
}

/// Asks the LAN gateway to forward an external TCP port to this host.
pub trait PortMapper: Send + Sync {
    /// Maps external `port` to the same local port and returns the gateway's
    /// external address.
    fn setup_mapping(&self, port: u16) -> Result<IpAddr, MappingError>;

    /// Removes the mapping for external `port`.
    fn remove_mapping(&self, port: u16) -> Result<(), MappingError>;
}

/// [`PortMapper`] speaking UPnP Internet Gateway Device.
#[derive(Debug, Clone)]
pub struct IgdPortMapper {
    discovery_timeout: Duration,
    lease_secs: u32,
    description: String,
}

impl IgdPortMapper {
    /// Creates a mapper with the given discovery timeout.
    pub fn new(discovery_timeout: Duration) -> Self {
        Self {
            discovery_timeout,
            lease_secs: 0,
            description: "Render Stats".to_string(),
        }
    }

    /// Creates a mapper from the `[nat]` configuration section.
    pub fn from_config(config: &NatConfig) -> Self {
        Self::new(config.discovery_timeout())
            .with_lease(config.lease_secs)
            .with_description(config.description.clone())
    }

    /// Sets the mapping lease in seconds (0 = until removed).
    pub fn with_lease(mut self, lease_secs: u32) -> Self {
        self.lease_secs = lease_secs;
        self
    }

    /// Sets the description shown in the gateway's mapping table.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Hard bound on one setup or teardown call.
    fn deadline(&self) -> Duration {
        self.discovery_timeout + GATEWAY_REQUEST_BUDGET
    }

    fn discover(&self) -> Result<Gateway, MappingError> {
        let options = SearchOptions {
            timeout: Some(self.discovery_timeout),
            ..Default::default()
        };
        let gateway =
            search_gateway(options).map_err(|e| MappingError::NoGateway(e.to_string()))?;
        debug!("Found UPnP gateway at {}", gateway.addr);
        Ok(gateway)
    }
}

impl PortMapper for IgdPortMapper {
    fn setup_mapping(&self, port: u16) -> Result<IpAddr, MappingError> {
        let mapper = self.clone();
        run_with_deadline("upnp-map", self.deadline(), move || mapper.add(port))
    }

    fn remove_mapping(&self, port: u16) -> Result<(), MappingError> {
        let mapper = self.clone();
        run_with_deadline("upnp-unmap", self.deadline(), move || mapper.remove(port))
    }
}

impl IgdPortMapper {
    fn add(&self, port: u16) -> Result<IpAddr, MappingError> {
        let gateway = self.discover()?;

        let external_ip = gateway
            .get_external_ip()
            .map_err(|e| MappingError::ExternalAddress(e.to_string()))?;

        let local_ip = local_address_towards(gateway.addr)?;
        gateway
            .add_port(
                PortMappingProtocol::TCP,
                port,
                SocketAddr::new(local_ip, port),
                self.lease_secs,
                &self.description,
            )
            .map_err(|e| MappingError::AddRejected(e.to_string()))?;

        info!(
            "Mapped {}:{} -> {}:{} via UPnP",
            external_ip, port, local_ip, port
        );
        Ok(external_ip)
    }

    fn remove(&self, port: u16) -> Result<(), MappingError> {
        let gateway = self.discover()?;
        gateway
            .remove_port(PortMappingProtocol::TCP, port)
            .map_err(|e| MappingError::RemoveRejected(e.to_string()))?;
        info!("Removed UPnP mapping for port {}", port);
        Ok(())
    }
}

/// Runs `op` on a named worker thread and waits at most `limit` for it.
///
/// On timeout the worker is left to finish on its own; its result is
/// dropped.
fn run_with_deadline<T, F>(name: &str, limit: Duration, op: F) -> Result<T, MappingError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, MappingError> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _ = tx.send(op());
        })
        .map_err(|e| MappingError::Worker(e.to_string()))?;

    match rx.recv_timeout(limit) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            warn!("{} abandoned after {:?}", name, limit);
            Err(MappingError::TimedOut(limit))
        }
        Err(RecvTimeoutError::Disconnected) => {
            Err(MappingError::Worker(format!("{} exited without a result", name)))
        }
    }
}

/// [`PortMapper`] used when mapping is switched off.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledPortMapper;

impl PortMapper for DisabledPortMapper {
    fn setup_mapping(&self, _port: u16) -> Result<IpAddr, MappingError> {
        Err(MappingError::Disabled)
    }

    fn remove_mapping(&self, _port: u16) -> Result<(), MappingError> {
        Ok(())
    }
}

/// Returns the local address the OS would use to reach `peer`.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
fn local_address_towards(peer: SocketAddr) -> io::Result<IpAddr> {
    let unspecified: IpAddr = match peer {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    let socket = UdpSocket::bind((unspecified, 0))?;
    socket.connect(peer)?;
    Ok(socket.local_addr()?.ip())
}
