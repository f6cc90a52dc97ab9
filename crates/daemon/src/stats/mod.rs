//! Job progress state shared between host callbacks and the HTTP path.
//!
//! - [`StatsStore`]: synchronized holder of the latest snapshot and log tail
//! - [`JobMonitor`]: adapter for the host's job-start/unit-complete callbacks

pub mod monitor;
pub mod store;

pub use monitor::JobMonitor;
pub use store::{
    LogBuffer, LogLevel, StatsSource, StatsStore, UnitProgress, DEFAULT_LOG_CAPACITY,
};
