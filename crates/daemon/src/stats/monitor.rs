//! Host callback adapter feeding the [`StatsStore`].
//!
//! The host invokes [`JobMonitor::on_job_start`] when a job begins and
//! [`JobMonitor::on_unit_complete`] after every finished unit. Unit duration
//! is measured here as wall-clock time between callbacks unless the host
//! supplies its own measurement.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use super::store::{LogLevel, StatsStore, UnitProgress};

/// Turns host job callbacks into [`StatsStore`] updates.
pub struct JobMonitor {
    stats: StatsStore,
    last_mark: Mutex<Option<Instant>>,
}

impl JobMonitor {
    /// Creates a monitor writing into `stats`.
    pub fn new(stats: StatsStore) -> Self {
        Self {
            stats,
            last_mark: Mutex::new(None),
        }
    }

    /// Returns the store this monitor writes to.
    pub fn stats(&self) -> &StatsStore {
        &self.stats
    }

    /// Job-start callback: clears the log and starts the unit stopwatch.
    pub fn on_job_start(&self) {
        self.stats.clear_log();
        *self.mark() = Some(Instant::now());
        debug!("Job started, log cleared");
    }

    /// Unit-complete callback with a measured duration.
    ///
    /// The duration is the time since the previous unit, or since
    /// [`on_job_start`](Self::on_job_start) for the first one. Without a
    /// preceding start the first unit reports zero.
    pub fn on_unit_complete(&self, current_unit: u64, total_units: u64) {
        let now = Instant::now();
        let elapsed = {
            let mut mark = self.mark();
            let elapsed = mark
                .map(|previous| now.saturating_duration_since(previous))
                .unwrap_or_default();
            *mark = Some(now);
            elapsed
        };

        self.on_unit_complete_timed(current_unit, total_units, elapsed);
    }

    /// Unit-complete callback with a host-supplied duration.
    pub fn on_unit_complete_timed(&self, current_unit: u64, total_units: u64, duration: Duration) {
        self.stats
            .update(UnitProgress::new(current_unit, total_units, duration));
    }

    /// Job-end callback: keeps the counters but flags the job inactive.
    pub fn on_job_end(&self) {
        *self.mark() = None;
        self.stats.mark_inactive();
        self.stats.append_log(LogLevel::Info, "Render finished.");
    }

    fn mark(&self) -> MutexGuard<'_, Option<Instant>> {
        self.last_mark.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
