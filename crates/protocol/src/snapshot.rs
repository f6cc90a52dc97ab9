//! Progress snapshot published on the `/stats` endpoint.
//!
//! The JSON field names are fixed; the bundled web viewer reads them
//! directly:
//!
//! ```text
//! {"current_frame":int,"total_frames":int,"progress_percentage":float,
//!  "last_frame_time":float,"total_expected_time":float,
//!  "render_active":bool,"log":string}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A consistent view of job progress at one instant.
///
/// Snapshots are values: a new one replaces the previous one wholesale, so a
/// reader never sees fields from two different updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProgressSnapshot {
    /// Index of the most recently completed unit.
    #[serde(rename = "current_frame")]
    pub current_unit: u64,

    /// Total number of units in the job.
    #[serde(rename = "total_frames")]
    pub total_units: u64,

    /// `current / total * 100`, or `0` when the total is unknown.
    pub progress_percentage: f64,

    /// Wall-clock duration of the last unit, in seconds.
    #[serde(rename = "last_frame_time")]
    pub last_unit_duration_secs: f64,

    /// `(total - current) * last_unit_duration_secs`.
    #[serde(rename = "total_expected_time")]
    pub estimated_remaining_secs: f64,

    /// Whether the job is still producing units.
    #[serde(rename = "render_active")]
    pub active: bool,

    /// Tail of the job log.
    #[serde(rename = "log")]
    pub log_tail: String,
}

impl ProgressSnapshot {
    /// Derives a snapshot from raw counters.
    ///
    /// Negative or non-finite durations are treated as zero. A current unit
    /// past the total is reported as complete rather than overshooting.
    pub fn from_counts(
        current_unit: u64,
        total_units: u64,
        last_unit_duration_secs: f64,
        active: bool,
    ) -> Self {
        let last_unit_duration_secs = if last_unit_duration_secs.is_finite() {
            last_unit_duration_secs.max(0.0)
        } else {
            0.0
        };

        let progress_percentage = if total_units > 0 {
            (current_unit as f64 / total_units as f64 * 100.0).min(100.0)
        } else {
            0.0
        };

        let remaining_units = total_units.saturating_sub(current_unit);
        let estimated_remaining_secs = remaining_units as f64 * last_unit_duration_secs;

        Self {
            current_unit,
            total_units,
            progress_percentage,
            last_unit_duration_secs,
            estimated_remaining_secs,
            active,
            log_tail: String::new(),
        }
    }

    /// Returns this snapshot with the given log tail attached.
    pub fn with_log(mut self, log_tail: impl Into<String>) -> Self {
        self.log_tail = log_tail.into();
        self
    }

    /// Serializes the snapshot to the `/stats` JSON body.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a `/stats` JSON body.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
