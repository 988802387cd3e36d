//! Failure taxonomy for hypervisor control-plane operations.
//!
//! Every external command the orchestrator issues resolves to exactly one of
//! three failure classes. The class decides what the caller may do next:
//! transient failures are retry-eligible, precondition failures require a
//! corrective state transition first, and fatal failures always propagate to
//! the operator.

use std::time::Duration;

/// Classified failure of a single control-plane operation.
///
/// The `operation` field names the external command (e.g. `revertSnapshot`)
/// so diagnostics can tell the operator exactly which call misbehaved.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ControlPlaneError {
    /// Retry-eligible: command timed out, resource busy, flaky spawn.
    #[error("{operation}: transient failure: {detail}")]
    Transient { operation: String, detail: String },

    /// Operation attempted in the wrong VM state (e.g. revert while running).
    /// Not retried as-is; the caller must resolve the precondition first.
    #[error("{operation}: precondition failed: {detail}")]
    Precondition { operation: String, detail: String },

    /// Misconfiguration, missing binary, malformed VM descriptor. Never
    /// retried, always surfaced.
    #[error("{operation}: fatal: {detail}")]
    Fatal { operation: String, detail: String },
}

impl ControlPlaneError {
    /// Transient failure for `operation`.
    pub fn transient(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    /// Precondition failure for `operation`.
    pub fn precondition(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Precondition {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    /// Fatal failure for `operation`.
    pub fn fatal(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Fatal {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    /// Transient timeout failure, with the deadline in the detail text.
    pub fn timed_out(operation: impl Into<String>, timeout: Duration) -> Self {
        let operation = operation.into();
        let detail = format!("no response within {}s", timeout.as_secs());
        Self::Transient { operation, detail }
    }

    /// Returns true for retry-eligible failures.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns the external command name this failure came from.
    pub fn operation(&self) -> &str {
        match self {
            Self::Transient { operation, .. }
            | Self::Precondition { operation, .. }
            | Self::Fatal { operation, .. } => operation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_helpers() {
        assert!(ControlPlaneError::transient("list", "busy").is_transient());
        assert!(!ControlPlaneError::precondition("revertSnapshot", "powered on").is_transient());
        assert!(!ControlPlaneError::fatal("start", "vmx missing").is_transient());
    }

    #[test]
    fn test_timed_out_is_transient() {
        let err = ControlPlaneError::timed_out("runProgramInGuest", Duration::from_secs(120));
        assert!(err.is_transient());
        assert_eq!(err.operation(), "runProgramInGuest");
        assert!(err.to_string().contains("120s"));
    }
}
