//! Synchronized progress snapshot and rolling job log.
//!
//! All state lives behind one mutex so the snapshot and the log tail a
//! reader sees always come from the same instant. No method performs I/O
//! or holds the lock longer than a clone.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use protocol::ProgressSnapshot;

/// Characters of log text retained by default.
pub const DEFAULT_LOG_CAPACITY: usize = 10_000;

/// Timestamp layout of job log lines.
const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";

/// Severity attached to a job log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Append-only text buffer bounded by a character count.
///
/// When the bound is exceeded only the trailing `capacity` characters are
/// kept. Truncation never splits a UTF-8 sequence.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    text: String,
    chars: usize,
    capacity: usize,
}

impl LogBuffer {
    /// Creates an empty buffer retaining at most `capacity` characters.
    pub fn new(capacity: usize) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            capacity,
        }
    }

    /// Appends `s`, dropping the oldest characters past the capacity.
    pub fn push_str(&mut self, s: &str) {
        self.text.push_str(s);
        self.chars += s.chars().count();

        if self.chars > self.capacity {
            let excess = self.chars - self.capacity;
            let cut = self
                .text
                .char_indices()
                .nth(excess)
                .map(|(idx, _)| idx)
                .unwrap_or(self.text.len());
            self.text.drain(..cut);
            self.chars = self.capacity;
        }
    }

    /// Empties the buffer.
    pub fn clear(&mut self) {
        self.text.clear();
        self.chars = 0;
    }

    /// Returns the retained text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Returns the number of retained characters.
    pub fn len_chars(&self) -> usize {
        self.chars
    }

    /// Returns whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Returns the retention bound.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

/// Raw inputs of one unit-complete callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitProgress {
    /// Index of the unit that just completed.
    pub current_unit: u64,
    /// Total units in the job.
    pub total_units: u64,
    /// How long the completed unit took.
    pub last_unit_duration: Duration,
    /// Whether the job is still running.
    pub active: bool,
}

impl UnitProgress {
    /// Progress of a running job.
    pub fn new(current_unit: u64, total_units: u64, last_unit_duration: Duration) -> Self {
        Self {
            current_unit,
            total_units,
            last_unit_duration,
            active: true,
        }
    }

    fn to_snapshot(self) -> ProgressSnapshot {
        ProgressSnapshot::from_counts(
            self.current_unit,
            self.total_units,
            self.last_unit_duration.as_secs_f64(),
            self.active,
        )
    }
}

/// Read access to the current progress, as seen by the HTTP path.
pub trait StatsSource: Send + Sync {
    /// Returns a consistent copy of the current progress.
    fn snapshot(&self) -> ProgressSnapshot;
}

struct StatsState {
    latest: Option<ProgressSnapshot>,
    log: LogBuffer,
}

/// Thread-safe holder of the latest [`ProgressSnapshot`] and the job log.
///
/// Cloning yields another handle to the same state.
#[derive(Clone)]
pub struct StatsStore {
    inner: Arc<Mutex<StatsState>>,
}

impl StatsStore {
    /// Creates a store with the default log capacity.
    pub fn new() -> Self {
        Self::with_log_capacity(DEFAULT_LOG_CAPACITY)
    }

    /// Creates a store retaining at most `capacity` log characters.
    pub fn with_log_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatsState {
                latest: None,
                log: LogBuffer::new(capacity),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatsState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the snapshot with one derived from `progress` and logs the unit.
    pub fn update(&self, progress: UnitProgress) {
        let snapshot = progress.to_snapshot();
        let line = format_log_line(
            LogLevel::Info,
            &format!(
                "Frame {} rendered. Progress: {:.2}%",
                snapshot.current_unit, snapshot.progress_percentage
            ),
        );

        let mut state = self.lock();
        state.latest = Some(snapshot);
        state.log.push_str(&line);
    }

    /// Empties the job log. Counters are left untouched.
    pub fn clear_log(&self) {
        let line = format_log_line(
            LogLevel::Info,
            "Render log cleared at render initialization.",
        );

        let mut state = self.lock();
        state.log.clear();
        state.log.push_str(&line);
    }

    /// Appends a timestamped line to the job log.
    pub fn append_log(&self, level: LogLevel, message: &str) {
        let line = format_log_line(level, message);
        self.lock().log.push_str(&line);
    }

    /// Flags the job as no longer running, keeping the last counters.
    pub fn mark_inactive(&self) {
        if let Some(snapshot) = self.lock().latest.as_mut() {
            snapshot.active = false;
        }
    }

    /// Returns the latest snapshot with the current log tail, or the zero
    /// snapshot if no unit has completed yet.
    pub fn read(&self) -> ProgressSnapshot {
        let state = self.lock();
        let snapshot = state.latest.clone().unwrap_or_default();
        snapshot.with_log(state.log.as_str())
    }
}

impl Default for StatsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsSource for StatsStore {
    fn snapshot(&self) -> ProgressSnapshot {
        self.read()
    }
}

/// Formats `message` as `"<timestamp> - <LEVEL> - <message>\n"`.
pub(crate) fn format_log_line(level: LogLevel, message: &str) -> String {
    format!(
        "{} - {} - {}\n",
        chrono::Local::now().format(LOG_TIME_FORMAT),
        level,
        message
    )
}
