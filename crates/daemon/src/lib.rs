//! # Render Stats Daemon Library
//!
//! This crate provides an embeddable HTTP status server that publishes the
//! live progress of a long-running render job to remote viewers.
//!
//! ## Overview
//!
//! - **Stats Store**: lock-protected progress snapshot and rolling log
//! - **Request Routing**: shared-secret check, JSON status and HTML viewer
//! - **Cooperative Polling**: non-blocking accept step driven by a scheduler
//! - **Reachability**: UPnP port mapping, public IP fallback, firewall rules
//! - **Lifecycle**: start/stop state machine with best-effort teardown
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Server Lifecycle                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │ Port Mapper  │  │  Public IP   │  │      Firewall        │  │
//! │  │   (UPnP)     │  │   Resolver   │  │                      │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘  │
//! │                                                                  │
//! │  ┌────────────┐   ┌──────────┐   ┌────────────────┐            │
//! │  │ Scheduler  │──▶│  Poller  │──▶│ Request Router │            │
//! │  └────────────┘   └──────────┘   └───────┬────────┘            │
//! │                                          │                      │
//! │  host callbacks ──▶ JobMonitor ──▶ ┌─────▼──────┐               │
//! │                                    │ StatsStore │               │
//! │                                    └────────────┘               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, JobMonitor, ManualScheduler, Preconditions, ServerLifecycle, StatsStore};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let stats = StatsStore::with_log_capacity(config.stats.log_capacity);
//!
//!     // The host pumps the scheduler from its own ~100ms timer.
//!     let scheduler = ManualScheduler::new();
//!     let mut server = ServerLifecycle::new(config, stats.clone())
//!         .with_scheduler(scheduler.clone());
//!     server.start(&Preconditions::satisfied())?;
//!     println!("Viewers can open {}", server.session().external_url);
//!
//!     let monitor = JobMonitor::new(stats);
//!     monitor.on_job_start();
//!     monitor.on_unit_complete(1, 250);
//!     scheduler.tick();
//!
//!     server.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`stats`]: Progress store and host callback adapter
//! - [`access`]: Access key generation and checking
//! - [`router`]: Request authentication and dispatch
//! - [`poller`]: Non-blocking poll step
//! - [`scheduler`]: Thread, tokio and host-driven poll drivers
//! - [`network`]: Listener, port mapping, public IP and firewall
//! - [`steps`]: Best-effort teardown runner
//! - [`lifecycle`]: Start/stop state machine
//! - [`ui`]: QR code rendering of the published URL

pub mod access;
pub mod config;
pub mod lifecycle;
pub mod network;
pub mod poller;
pub mod router;
pub mod scheduler;
pub mod stats;
pub mod steps;
pub mod ui;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::{Config, ConfigError};

// Re-export stats types for convenience
pub use stats::{JobMonitor, LogLevel, StatsSource, StatsStore, UnitProgress};

// Re-export access types for convenience
pub use access::AccessKey;

// Re-export router and poller types for convenience
pub use poller::{PollOutcome, Poller, PollerSettings};
pub use router::RequestRouter;
pub use scheduler::{ManualScheduler, Scheduler, ThreadScheduler, TokioScheduler};

// Re-export network types for convenience
pub use network::{
    Firewall, HttpPublicIpResolver, IgdPortMapper, NoopFirewall, PortMapper, PublicIpResolver,
    SystemFirewall,
};

// Re-export lifecycle types for convenience
pub use lifecycle::{
    Indicator, IndicatorSet, LifecycleEvent, Preconditions, ServerLifecycle, ServerSession,
    ServerState, StartError,
};
pub use steps::{StepOutcome, TeardownReport};
