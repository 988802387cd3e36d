//! Snapshot preparation state machine.
//!
//! Guarantees the "powered off → revert → power on" ordering before a task
//! touches the guest. Every transition is verified: the target snapshot must
//! exist, the shutdown must be observed, the revert must succeed, and the
//! guest must actually come up. A revert failure is surfaced as an error and
//! the half-reverted VM is left for the operator to inspect; no recovery
//! action is guessed.

use crate::config::TimeoutConfig;
use crate::retry::{RetryError, RetryPolicy};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;
use vmharness_proto::{ControlPlane, ControlPlaneError, StatusPublisher};

/// Phase of one preparation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepPhase {
    /// No preparation attempted yet.
    Unknown,
    /// Checking that the target snapshot exists.
    Verifying,
    /// Shutdown observed (or the VM was already off).
    PoweredOff,
    /// Revert command in flight.
    Reverting,
    /// Revert confirmed.
    Reverted,
    /// Start command issued, waiting for the guest to come up.
    PoweringOn,
    /// The VM is live on the target snapshot; the task may proceed.
    Ready,
    /// Terminal failure; details are in the returned `PrepareError`.
    Error,
}

impl PrepPhase {
    /// True while a preparation cycle is mid-flight.
    fn in_flight(self) -> bool {
        !matches!(self, Self::Unknown | Self::Ready | Self::Error)
    }
}

/// Drives one VM through the revert-and-restart cycle.
pub struct SnapshotStateMachine {
    control: Arc<dyn ControlPlane>,
    retry: RetryPolicy,
    timeouts: TimeoutConfig,
    status: StatusPublisher,
    use_snapshots: bool,
    phase: Mutex<PrepPhase>,
}

impl SnapshotStateMachine {
    pub fn new(
        control: Arc<dyn ControlPlane>,
        retry: RetryPolicy,
        timeouts: TimeoutConfig,
        status: StatusPublisher,
    ) -> Self {
        Self {
            control,
            retry,
            timeouts,
            status,
            use_snapshots: true,
            phase: Mutex::new(PrepPhase::Unknown),
        }
    }

    /// Disables the verify/revert steps; `prepare` then only ensures the VM
    /// is powered on. Used when the operator runs against a live VM on
    /// purpose.
    pub fn with_snapshots_disabled(mut self) -> Self {
        self.use_snapshots = false;
        self
    }

    /// The phase the last (or current) preparation reached.
    pub fn phase(&self) -> PrepPhase {
        *self.phase.lock().expect("prep phase lock poisoned")
    }

    fn set_phase(&self, phase: PrepPhase) {
        *self.phase.lock().expect("prep phase lock poisoned") = phase;
    }

    /// Runs the full preparation cycle for `snapshot`.
    ///
    /// Returns only once the VM is `Ready` or the cycle failed. Calling this
    /// again while a previous cycle is still mid-flight is rejected; callers
    /// wait for the prior call to resolve first.
    pub async fn prepare(&self, snapshot: &str, fullscreen: bool) -> Result<(), PrepareError> {
        {
            let mut phase = self.phase.lock().expect("prep phase lock poisoned");
            if phase.in_flight() {
                return Err(PrepareError::Busy { phase: *phase });
            }
            *phase = PrepPhase::Verifying;
        }

        let result = self.run_cycle(snapshot, fullscreen).await;
        match &result {
            Ok(()) => self.set_phase(PrepPhase::Ready),
            Err(_) => self.set_phase(PrepPhase::Error),
        }
        result
    }

    async fn run_cycle(&self, snapshot: &str, fullscreen: bool) -> Result<(), PrepareError> {
        if self.use_snapshots {
            self.verify_snapshot(snapshot).await?;
            self.ensure_powered_off().await?;
            self.revert(snapshot).await?;
        } else {
            info!("snapshot revert disabled, skipping verify and revert");
            self.status.message("snapshot revert disabled by configuration");
            if self.control.is_running().await.map_err(PrepareError::Query)? {
                return Ok(());
            }
        }
        self.power_on(fullscreen).await
    }

    /// The snapshot must exist before anything else happens; a typo in the
    /// snapshot name must never be discovered after a power-off.
    async fn verify_snapshot(&self, snapshot: &str) -> Result<(), PrepareError> {
        self.status
            .message(format!("verifying snapshot '{snapshot}' exists"));

        let available = self
            .retry
            .run_transient("listSnapshots", || self.control.list_snapshots())
            .await?;

        if available.contains(snapshot) {
            Ok(())
        } else {
            Err(PrepareError::SnapshotNotFound {
                name: snapshot.to_string(),
                available,
            })
        }
    }

    async fn ensure_powered_off(&self) -> Result<(), PrepareError> {
        let running = self
            .retry
            .run_transient("list", || self.control.is_running())
            .await?;

        if !running {
            self.set_phase(PrepPhase::PoweredOff);
            return Ok(());
        }

        self.status.message("VM is running, requesting shutdown");
        self.control
            .power_off()
            .await
            .map_err(PrepareError::PowerOff)?;

        self.wait_for_power_state(false, self.timeouts.shutdown())
            .await
            .map_err(|waited| PrepareError::ShutdownTimeout { waited })?;

        self.set_phase(PrepPhase::PoweredOff);
        Ok(())
    }

    async fn revert(&self, snapshot: &str) -> Result<(), PrepareError> {
        self.set_phase(PrepPhase::Reverting);
        self.status
            .message(format!("reverting to snapshot '{snapshot}'"));

        // Reverts are slow and non-retryable mid-flight; the long per-attempt
        // timeout lives in the adapter. Only a cleanly-failed attempt is
        // retried here.
        self.retry
            .run_transient("revertToSnapshot", || self.control.revert_snapshot(snapshot))
            .await
            .map_err(PrepareError::Revert)?;

        self.set_phase(PrepPhase::Reverted);
        Ok(())
    }

    async fn power_on(&self, fullscreen: bool) -> Result<(), PrepareError> {
        self.set_phase(PrepPhase::PoweringOn);
        self.status.message("powering on VM");

        self.retry
            .run_transient("start", || self.control.power_on(fullscreen))
            .await?;

        self.wait_for_power_state(true, self.timeouts.power_on())
            .await
            .map_err(|waited| PrepareError::StartupTimeout { waited })?;

        info!("VM is up and ready for task execution");
        self.status.message("VM is ready");
        Ok(())
    }

    /// Polls `is_running` until it reports `target` or `deadline` elapses.
    /// On deadline, returns the duration actually waited.
    async fn wait_for_power_state(
        &self,
        target: bool,
        deadline: Duration,
    ) -> Result<(), Duration> {
        let started = Instant::now();
        loop {
            if let Ok(running) = self.control.is_running().await {
                if running == target {
                    return Ok(());
                }
            }
            if started.elapsed() >= deadline {
                return Err(started.elapsed());
            }
            tokio::time::sleep(self.timeouts.poll_interval()).await;
        }
    }
}

impl std::fmt::Debug for SnapshotStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStateMachine")
            .field("use_snapshots", &self.use_snapshots)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

/// Why a preparation cycle did not reach `Ready`.
#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    /// A previous `prepare` call has not resolved yet.
    #[error("preparation already in flight (phase {phase:?})")]
    Busy { phase: PrepPhase },

    /// The target snapshot does not exist on this VM. The available names
    /// are included so the operator can spot the typo or the wrong VM.
    #[error("snapshot '{name}' not found; available snapshots: {available:?}")]
    SnapshotNotFound {
        name: String,
        available: BTreeSet<String>,
    },

    /// A state query (list snapshots, is-running) failed past its retries.
    #[error(transparent)]
    QueryRetry(#[from] RetryError<ControlPlaneError>),

    /// A single state query failed outside the retry wrapper.
    #[error(transparent)]
    Query(ControlPlaneError),

    /// The shutdown command itself was refused.
    #[error("power off failed: {0}")]
    PowerOff(ControlPlaneError),

    /// The guest never reported powered-off within the shutdown deadline.
    #[error("VM still running after waiting {waited:?} for shutdown")]
    ShutdownTimeout { waited: Duration },

    /// The revert failed after exhausting retries. The VM may be in a
    /// half-reverted state; operator intervention is required.
    #[error("snapshot revert failed: {0}")]
    Revert(RetryError<ControlPlaneError>),

    /// The guest never reported running within the startup deadline.
    #[error("VM not running after waiting {waited:?} for startup")]
    StartupTimeout { waited: Duration },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeControlPlane;
    use std::time::Duration;

    fn machine(fake: &Arc<FakeControlPlane>) -> SnapshotStateMachine {
        let mut timeouts = TimeoutConfig::default();
        timeouts.poll_interval_ms = 5;
        timeouts.shutdown_secs = 1;
        timeouts.power_on_secs = 1;
        SnapshotStateMachine::new(
            Arc::clone(fake) as Arc<dyn ControlPlane>,
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(4)),
            timeouts,
            StatusPublisher::detached(),
        )
    }

    #[tokio::test]
    async fn test_full_cycle_from_running() {
        let fake = Arc::new(
            FakeControlPlane::new()
                .with_snapshots(["clean"])
                .with_running(true),
        );
        let machine = machine(&fake);

        machine.prepare("clean", false).await.unwrap();

        assert_eq!(machine.phase(), PrepPhase::Ready);
        assert_eq!(fake.reverts(), vec!["clean"]);
        // stop happened before the revert, start after it
        let calls = fake.calls();
        let stop = calls.iter().position(|c| c == "stop").unwrap();
        let revert = calls.iter().position(|c| c == "revertToSnapshot").unwrap();
        let start = calls.iter().position(|c| c == "start").unwrap();
        assert!(stop < revert && revert < start);
        assert!(fake.is_running_now());
    }

    #[tokio::test]
    async fn test_missing_snapshot_reports_available() {
        let fake = Arc::new(FakeControlPlane::new().with_snapshots(["base", "updated"]));
        let machine = machine(&fake);

        let err = machine.prepare("clean", false).await.unwrap_err();
        assert_eq!(machine.phase(), PrepPhase::Error);
        match err {
            PrepareError::SnapshotNotFound { name, available } => {
                assert_eq!(name, "clean");
                let names: Vec<_> = available.iter().map(String::as_str).collect();
                assert_eq!(names, vec!["base", "updated"]);
            }
            other => panic!("expected SnapshotNotFound, got {other:?}"),
        }
        // nothing was powered off or reverted
        assert!(fake.reverts().is_empty());
        assert!(!fake.calls().iter().any(|c| c == "stop"));
    }

    #[tokio::test]
    async fn test_powered_off_vm_skips_shutdown() {
        let fake = Arc::new(FakeControlPlane::new().with_snapshots(["clean"]));
        let machine = machine(&fake);

        machine.prepare("clean", false).await.unwrap();
        assert!(!fake.calls().iter().any(|c| c == "stop"));
        assert_eq!(fake.reverts(), vec!["clean"]);
    }

    #[tokio::test]
    async fn test_revert_failure_propagates() {
        // The defect this design corrects: a failed revert must never be
        // swallowed and followed by a power-on.
        let fake = Arc::new(
            FakeControlPlane::new()
                .with_snapshots(["clean"])
                .failing_revert(),
        );
        let machine = machine(&fake);

        let err = machine.prepare("clean", false).await.unwrap_err();
        assert!(matches!(err, PrepareError::Revert(_)));
        assert_eq!(machine.phase(), PrepPhase::Error);
        assert!(!fake.calls().iter().any(|c| c == "start"));
    }

    #[tokio::test]
    async fn test_shutdown_deadline_is_error() {
        let fake = Arc::new(
            FakeControlPlane::new()
                .with_snapshots(["clean"])
                .with_running(true)
                .ignoring_power_off(),
        );
        let machine = machine(&fake);

        let err = machine.prepare("clean", false).await.unwrap_err();
        assert!(matches!(err, PrepareError::ShutdownTimeout { .. }));
    }

    #[tokio::test]
    async fn test_prepare_idempotent_after_ready() {
        let fake = Arc::new(
            FakeControlPlane::new()
                .with_snapshots(["clean"])
                .with_running(true),
        );
        let machine = machine(&fake);

        machine.prepare("clean", false).await.unwrap();
        assert_eq!(machine.phase(), PrepPhase::Ready);

        // A second cycle is allowed once the first resolved, and ends in the
        // same observable state with exactly one more revert+restart.
        machine.prepare("clean", false).await.unwrap();
        assert_eq!(machine.phase(), PrepPhase::Ready);
        assert_eq!(fake.reverts(), vec!["clean", "clean"]);
    }

    #[tokio::test]
    async fn test_snapshots_disabled_only_powers_on() {
        let fake = Arc::new(FakeControlPlane::new());
        let machine = machine(&fake).with_snapshots_disabled();

        machine.prepare("clean", false).await.unwrap();
        assert!(fake.reverts().is_empty());
        assert!(!fake.calls().iter().any(|c| c == "listSnapshots"));
        assert!(fake.is_running_now());
    }
}
