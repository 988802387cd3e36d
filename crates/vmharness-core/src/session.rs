//! Run session state.
//!
//! The orchestrator exclusively owns the mutable session; the GUI layer
//! observes it through `SessionHandle::snapshot()` (a read-only clone) and
//! through status events. Once a verdict is recorded or the run is aborted
//! the session is terminal and no further mutation happens.

use chrono::Local;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use vmharness_proto::{RunId, RunPhase, Verdict};

/// Mutable state of one run.
#[derive(Debug)]
pub struct RunSession {
    id: RunId,
    task_id: String,
    phase: RunPhase,
    log: Vec<String>,
    verdict: Option<Verdict>,
    error: Option<String>,
}

impl RunSession {
    pub fn new(id: RunId, task_id: impl Into<String>) -> Self {
        Self {
            id,
            task_id: task_id.into(),
            phase: RunPhase::Created,
            log: Vec::new(),
            verdict: None,
            error: None,
        }
    }

    pub fn id(&self) -> &RunId {
        &self.id
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: RunPhase) {
        self.phase = phase;
    }

    /// Appends a timestamped line to the status log.
    pub(crate) fn append(&mut self, line: &str) {
        let stamped = format!("[{}] {line}", Local::now().format("%H:%M:%S"));
        self.log.push(stamped);
    }

    pub(crate) fn record_verdict(&mut self, verdict: Verdict) {
        self.verdict = Some(verdict);
    }

    pub(crate) fn record_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    pub fn verdict(&self) -> Option<&Verdict> {
        self.verdict.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// Read-only view of a session at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: RunId,
    pub task_id: String,
    pub phase: RunPhase,
    pub log: Vec<String>,
    pub verdict: Option<Verdict>,
    pub error: Option<String>,
}

/// Shared handle to a session.
///
/// Cloning shares the same session. Observers get snapshots only; mutation
/// stays inside this crate.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inner: Arc<Mutex<RunSession>>,
}

impl SessionHandle {
    pub fn new(session: RunSession) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    /// A point-in-time copy of the session.
    pub fn snapshot(&self) -> SessionSnapshot {
        let session = self.inner.lock().expect("session lock poisoned");
        SessionSnapshot {
            id: session.id.clone(),
            task_id: session.task_id.clone(),
            phase: session.phase,
            log: session.log.clone(),
            verdict: session.verdict.clone(),
            error: session.error.clone(),
        }
    }

    /// The current phase without cloning the whole session.
    pub fn phase(&self) -> RunPhase {
        self.inner.lock().expect("session lock poisoned").phase
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut RunSession) -> R) -> R {
        f(&mut self.inner.lock().expect("session lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_is_detached_copy() {
        let handle = SessionHandle::new(RunSession::new(
            RunId::from_raw("20260101_120000_t1"),
            "t1",
        ));

        handle.update(|s| {
            s.set_phase(RunPhase::Preparing);
            s.append("reverting to snapshot 'clean'");
        });

        let before = handle.snapshot();
        handle.update(|s| {
            s.set_phase(RunPhase::Completed);
            s.record_verdict(Verdict {
                passed: true,
                details: json!({}),
            });
        });

        // the earlier snapshot is unaffected
        assert_eq!(before.phase, RunPhase::Preparing);
        assert!(before.verdict.is_none());
        assert_eq!(before.log.len(), 1);
        assert!(before.log[0].ends_with("reverting to snapshot 'clean'"));

        let after = handle.snapshot();
        assert_eq!(after.phase, RunPhase::Completed);
        assert!(after.verdict.unwrap().passed);
    }

    #[test]
    fn test_log_lines_are_timestamped() {
        let handle = SessionHandle::new(RunSession::new(RunId::from_raw("r"), "t"));
        handle.update(|s| s.append("hello"));
        let snapshot = handle.snapshot();
        // [HH:MM:SS] prefix
        assert_eq!(&snapshot.log[0][0..1], "[");
        assert_eq!(&snapshot.log[0][9..11], "] ");
    }
}
