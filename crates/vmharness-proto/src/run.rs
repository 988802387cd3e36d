//! Run identity and lifecycle phases.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier for one task execution: local timestamp plus task id.
///
/// Doubles as the run-directory name. Must be unique per process; starting
/// the same task twice within one second is a caller bug, which the
/// orchestrator rejects rather than silently overwriting artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Creates a run id for `task_id` stamped with the current local time.
    pub fn new(task_id: &str) -> Self {
        Self(format!(
            "{}_{}",
            Local::now().format("%Y%m%d_%H%M%S"),
            task_id
        ))
    }

    /// Creates a run id from a pre-built string (tests, replayed artifacts).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Phase of a run session, as observed by the GUI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Session created, pipeline not yet started.
    Created,
    /// Snapshot verification, revert, and power-on in progress.
    Preparing,
    /// Setup actions executing in order.
    RunningActions,
    /// An action failed; the operator must choose retry, skip, or cancel.
    AwaitingDecision,
    /// Setup done; the human is operating the guest.
    WaitingForOperator,
    /// Evaluation round trip in progress.
    Evaluating,
    /// Terminal: evaluation produced a verdict.
    Completed,
    /// Terminal: the run halted on an unrecoverable error.
    Failed,
    /// Terminal: the run was cancelled at a safe boundary.
    Cancelled,
}

impl RunPhase {
    /// Whether this phase ends the run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Short name used in status lines and the outcome artifact.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Preparing => "preparing",
            Self::RunningActions => "running_actions",
            Self::AwaitingDecision => "awaiting_decision",
            Self::WaitingForOperator => "waiting_for_operator",
            Self::Evaluating => "evaluating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_embeds_task_id() {
        let id = RunId::new("chrome-dnt-001");
        assert!(id.as_str().ends_with("_chrome-dnt-001"));
        // timestamp prefix: YYYYmmdd_HHMMSS
        assert_eq!(id.as_str().split('_').next().unwrap().len(), 8);
    }

    #[test]
    fn test_terminal_phases() {
        assert!(RunPhase::Completed.is_terminal());
        assert!(RunPhase::Failed.is_terminal());
        assert!(RunPhase::Cancelled.is_terminal());
        assert!(!RunPhase::WaitingForOperator.is_terminal());
        assert!(!RunPhase::Preparing.is_terminal());
    }
}
