//! Server lifecycle for wiring together the status server.
//!
//! This module provides the `ServerLifecycle` that owns one server session
//! at a time: it acquires the listening socket, opens the firewall, maps
//! the port, generates the access key, publishes the URL and hands a
//! [`Poller`] to the configured [`Scheduler`]. Stopping reverses each of
//! those steps exactly once.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::access::AccessKey;
use crate::config::{Config, ConfigError};
use crate::network::{
    bind_dual_stack, format_public_url, resolve_external_address, DisabledPortMapper, Firewall,
    HttpPublicIpResolver, IgdPortMapper, PortMapper, PublicIpResolver, SystemFirewall,
};
use crate::poller::{ListenerSlot, Poller, PollerSettings};
use crate::router::RequestRouter;
use crate::scheduler::{Scheduler, ThreadScheduler};
use crate::stats::StatsStore;
use crate::steps::TeardownReport;

/// Capacity of the lifecycle event channel.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// No session exists.
    Stopped,
    /// A start is in progress.
    Starting,
    /// Listening and registered with the scheduler.
    Running,
}

/// Host-supplied prerequisites checked before anything is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preconditions {
    /// Required host components are installed.
    pub dependencies_ready: bool,
    /// The host permits network access.
    pub network_enabled: bool,
}

impl Preconditions {
    /// Preconditions with every flag set.
    pub fn satisfied() -> Self {
        Self {
            dependencies_ready: true,
            network_enabled: true,
        }
    }

    fn check(&self) -> Result<(), StartError> {
        if !self.dependencies_ready {
            return Err(StartError::DependenciesMissing);
        }
        if !self.network_enabled {
            return Err(StartError::NetworkDisabled);
        }
        Ok(())
    }
}

impl Default for Preconditions {
    fn default() -> Self {
        Self::satisfied()
    }
}

/// Reasons a start attempt ended back in [`ServerState::Stopped`].
#[derive(Debug, Error)]
pub enum StartError {
    #[error("required dependencies are not installed")]
    DependenciesMissing,

    #[error("network access is disabled; enable it and start again")]
    NetworkDisabled,

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("failed to listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// Host-visible state of the current session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSession {
    /// The listening socket is open.
    pub listening: bool,
    /// Published URL, empty when stopped.
    pub external_url: String,
    /// Key required on every request.
    pub access_key: Option<AccessKey>,
    /// A gateway mapping forwards the port.
    pub mapping_active: bool,
    /// Message from the last failed start, if any.
    pub last_start_error: Option<String>,
    /// Address the listener is bound to.
    pub local_addr: Option<SocketAddr>,
}

/// Events emitted by the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// State changed.
    StateChanged(ServerState),
    /// A session started and published its URL.
    UrlPublished { url: String },
    /// A start attempt failed.
    StartFailed { message: String },
}

/// Tri-state indicator for host status displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    Ok,
    Waiting,
    Failed,
}

/// Indicators for dependency, network and server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndicatorSet {
    pub dependencies: Indicator,
    pub network: Indicator,
    pub server: Indicator,
}

/// Resources held by a running session, released by [`ServerLifecycle::stop`].
struct ActiveSession {
    slot: Arc<ListenerSlot>,
    port: u16,
    firewall_open: bool,
    mapping_active: bool,
}

/// Owns the status server's start/stop state machine.
pub struct ServerLifecycle {
    /// Configuration.
    config: Config,
    /// Progress state served to clients.
    stats: StatsStore,
    /// Gateway port mapping.
    mapper: Box<dyn PortMapper>,
    /// Public address fallback.
    resolver: Box<dyn PublicIpResolver>,
    /// Host firewall.
    firewall: Box<dyn Firewall>,
    /// Driver for the poller.
    scheduler: Box<dyn Scheduler>,
    /// Current state.
    state: ServerState,
    /// Host-visible session state.
    session: ServerSession,
    /// Resources of the running session.
    active: Option<ActiveSession>,
    /// Preconditions passed to the last start.
    last_preconditions: Option<Preconditions>,
    /// Event sender.
    event_tx: broadcast::Sender<LifecycleEvent>,
}

impl ServerLifecycle {
    /// Creates a stopped lifecycle with collaborators built from `config`.
    pub fn new(config: Config, stats: StatsStore) -> Self {
        let mapper: Box<dyn PortMapper> = if config.nat.upnp_enabled {
            Box::new(IgdPortMapper::from_config(&config.nat))
        } else {
            Box::new(DisabledPortMapper)
        };
        let resolver = Box::new(HttpPublicIpResolver::from_config(&config.nat));
        let firewall = SystemFirewall::from_config(&config.firewall);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            config,
            stats,
            mapper,
            resolver,
            firewall,
            scheduler: Box::new(ThreadScheduler),
            state: ServerState::Stopped,
            session: ServerSession::default(),
            active: None,
            last_preconditions: None,
            event_tx,
        }
    }

    /// Replaces the port mapper.
    pub fn with_port_mapper(mut self, mapper: impl PortMapper + 'static) -> Self {
        self.mapper = Box::new(mapper);
        self
    }

    /// Replaces the public IP resolver.
    pub fn with_ip_resolver(mut self, resolver: impl PublicIpResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /// Replaces the firewall.
    pub fn with_firewall(mut self, firewall: impl Firewall + 'static) -> Self {
        self.firewall = Box::new(firewall);
        self
    }

    /// Replaces the scheduler that drives the poller.
    pub fn with_scheduler(mut self, scheduler: impl Scheduler + 'static) -> Self {
        self.scheduler = Box::new(scheduler);
        self
    }

    /// Returns the current state.
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Returns the host-visible session state.
    pub fn session(&self) -> &ServerSession {
        &self.session
    }

    /// Returns the stats store served by this lifecycle.
    pub fn stats(&self) -> &StatsStore {
        &self.stats
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a receiver for lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.event_tx.subscribe()
    }

    /// Starts a session.
    ///
    /// Does nothing if a session is already running. On failure the state
    /// returns to [`ServerState::Stopped`] and the message is kept in
    /// [`ServerSession::last_start_error`]. Mapping and lookup failures are
    /// not start failures; they only change the published address.
    pub fn start(&mut self, preconditions: &Preconditions) -> Result<(), StartError> {
        if self.state != ServerState::Stopped {
            debug!("Start ignored, server is {:?}", self.state);
            return Ok(());
        }

        self.last_preconditions = Some(*preconditions);
        self.set_state(ServerState::Starting);
        info!("Starting status server...");

        if let Err(e) = preconditions.check() {
            return Err(self.fail_start(e));
        }
        if let Err(e) = self.config.validate() {
            return Err(self.fail_start(e.into()));
        }

        let port = self.config.server.port;
        let listener = match bind_dual_stack(port, self.config.server.backlog) {
            Ok(listener) => listener,
            Err(source) => return Err(self.fail_start(StartError::Bind { port, source })),
        };
        let local_addr = listener.local_addr().ok();
        let port = local_addr.map_or(port, |addr| addr.port());

        let firewall_open = match self.firewall.allow(port) {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not open firewall for port {}: {}", port, e);
                false
            }
        };

        let external = resolve_external_address(self.mapper.as_ref(), self.resolver.as_ref(), port);
        let key = AccessKey::generate();
        let url = format_public_url(external.ip, port, &key);

        let slot = Arc::new(ListenerSlot::new(listener));
        let router = Arc::new(RequestRouter::new(self.stats.clone(), key.clone()));
        let settings = PollerSettings::from_config(&self.config.server);
        self.scheduler
            .register(Poller::new(Arc::clone(&slot), router, settings));

        self.active = Some(ActiveSession {
            slot,
            port,
            firewall_open,
            mapping_active: external.mapped,
        });
        self.session = ServerSession {
            listening: true,
            external_url: url.clone(),
            access_key: Some(key),
            mapping_active: external.mapped,
            last_start_error: None,
            local_addr,
        };
        self.set_state(ServerState::Running);

        info!("Status server running at {}", url);
        let _ = self.event_tx.send(LifecycleEvent::UrlPublished { url });
        Ok(())
    }

    /// Stops the running session.
    ///
    /// Each teardown step runs even if an earlier one failed. Returns an
    /// empty report when no session was running.
    pub fn stop(&mut self) -> TeardownReport {
        let mut report = TeardownReport::new();
        let Some(active) = self.active.take() else {
            debug!("Stop ignored, server is {:?}", self.state);
            return report;
        };

        info!("Stopping status server...");
        let port = active.port;

        report.run("close listener", || {
            if active.slot.close() {
                Ok(())
            } else {
                Err("listener was already closed")
            }
        });

        if active.mapping_active {
            report.run("remove port mapping", || self.mapper.remove_mapping(port));
        } else {
            report.skip("remove port mapping");
        }

        if active.firewall_open {
            report.run("revoke firewall rule", || self.firewall.revoke(port));
        } else {
            report.skip("revoke firewall rule");
        }

        self.session = ServerSession::default();
        self.set_state(ServerState::Stopped);

        if report.is_clean() {
            info!("Status server stopped");
        } else {
            warn!("Status server stopped with teardown failures");
        }
        report
    }

    /// Returns indicators for the host's status display.
    pub fn status(&self) -> IndicatorSet {
        let flag = |ready: fn(&Preconditions) -> bool| match self.last_preconditions {
            None => Indicator::Waiting,
            Some(p) if ready(&p) => Indicator::Ok,
            Some(_) => Indicator::Failed,
        };

        let server = match self.state {
            ServerState::Running => Indicator::Ok,
            ServerState::Starting => Indicator::Waiting,
            ServerState::Stopped if self.session.last_start_error.is_some() => Indicator::Failed,
            ServerState::Stopped => Indicator::Waiting,
        };

        IndicatorSet {
            dependencies: flag(|p| p.dependencies_ready),
            network: flag(|p| p.network_enabled),
            server,
        }
    }

    fn fail_start(&mut self, err: StartError) -> StartError {
        let message = err.to_string();
        error!("Failed to start status server: {}", message);

        self.session = ServerSession {
            last_start_error: Some(message.clone()),
            ..ServerSession::default()
        };
        self.set_state(ServerState::Stopped);
        let _ = self.event_tx.send(LifecycleEvent::StartFailed { message });
        err
    }

    fn set_state(&mut self, state: ServerState) {
        self.state = state;
        let _ = self.event_tx.send(LifecycleEvent::StateChanged(state));
    }
}

impl Drop for ServerLifecycle {
    fn drop(&mut self) {
        if self.active.is_some() {
            let report = self.stop();
            for (step, message) in report.failures() {
                warn!("Teardown at exit: {} failed: {}", step, message);
            }
        }
    }
}
