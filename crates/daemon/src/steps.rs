//! Best-effort step runner used during teardown.
//!
//! Each step runs regardless of how earlier steps ended. Failures are
//! logged and recorded in the [`TeardownReport`] instead of aborting.

use std::fmt;

use tracing::{debug, warn};

/// Result of a single best-effort step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step succeeded.
    Done,
    /// The step did not apply to the current session.
    Skipped,
    /// The step failed with the given message.
    Failed(String),
}

/// Ordered record of teardown steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    steps: Vec<(&'static str, StepOutcome)>,
}

impl TeardownReport {
    /// Creates an empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `step`, logging and recording its outcome under `name`.
    pub fn run<E, F>(&mut self, name: &'static str, step: F) -> &mut Self
    where
        E: fmt::Display,
        F: FnOnce() -> Result<(), E>,
    {
        let outcome = match step() {
            Ok(()) => {
                debug!("Teardown step '{}' done", name);
                StepOutcome::Done
            }
            Err(e) => {
                warn!("Teardown step '{}' failed: {}", name, e);
                StepOutcome::Failed(e.to_string())
            }
        };
        self.steps.push((name, outcome));
        self
    }

    /// Records `name` as not applicable.
    pub fn skip(&mut self, name: &'static str) -> &mut Self {
        self.steps.push((name, StepOutcome::Skipped));
        self
    }

    /// Returns the recorded steps in execution order.
    pub fn steps(&self) -> &[(&'static str, StepOutcome)] {
        &self.steps
    }

    /// Returns the outcome recorded for `name`.
    pub fn outcome(&self, name: &str) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|(step, _)| *step == name)
            .map(|(_, outcome)| outcome)
    }

    /// Returns `true` when no step failed.
    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Iterates over failed steps and their messages.
    pub fn failures(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.steps.iter().filter_map(|(name, outcome)| match outcome {
            StepOutcome::Failed(message) => Some((*name, message.as_str())),
            _ => None,
        })
    }

    /// Returns `true` when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_does_not_stop_later_steps() {
        let mut ran = Vec::new();
        let mut report = TeardownReport::new();

        report
            .run("first", || {
                ran.push(1);
                Err::<(), _>("boom")
            })
            .run("second", || {
                ran.push(2);
                Ok::<(), String>(())
            });

        assert_eq!(ran, vec![1, 2]);
        assert!(!report.is_clean());
        assert_eq!(report.failures().collect::<Vec<_>>(), vec![("first", "boom")]);
        assert_eq!(report.outcome("second"), Some(&StepOutcome::Done));
    }

    #[test]
    fn test_skipped_is_clean() {
        let mut report = TeardownReport::new();
        report.skip("remove mapping");
        assert!(report.is_clean());
        assert!(!report.is_empty());
        assert_eq!(report.outcome("remove mapping"), Some(&StepOutcome::Skipped));
        assert_eq!(report.outcome("missing"), None);
    }

    #[test]
    fn test_empty_report() {
        let report = TeardownReport::default();
        assert!(report.is_empty());
        assert!(report.is_clean());
    }
}
