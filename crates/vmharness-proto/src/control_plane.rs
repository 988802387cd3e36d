//! The hypervisor control-plane seam.
//!
//! Everything above this trait is hypervisor-agnostic: the orchestrator,
//! snapshot state machine, and action handlers talk only to `ControlPlane`.
//! The vmrun adapter implements it against the real CLI; the core testing
//! module implements it as an in-memory fake.

use crate::error::ControlPlaneError;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// Result alias for control-plane operations.
pub type CpResult<T> = Result<T, ControlPlaneError>;

/// One VM's control interface.
///
/// Each method issues exactly one external command invocation and classifies
/// the outcome per the failure taxonomy. No method blocks indefinitely: every
/// call carries an explicit or adapter-configured timeout, and waits are the
/// caller's polling loops, bounded by the caller's deadline.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Powers the VM on, optionally in fullscreen presentation mode.
    ///
    /// Returns once the start command is accepted; callers poll `is_running`
    /// to confirm the guest actually came up.
    async fn power_on(&self, fullscreen: bool) -> CpResult<()>;

    /// Requests a guest shutdown.
    ///
    /// Not idempotent: a timed-out stop may have partially committed, so the
    /// adapter classifies its own timeout as fatal rather than transient.
    async fn power_off(&self) -> CpResult<()>;

    /// Whether the VM is currently listed as running.
    async fn is_running(&self) -> CpResult<bool>;

    /// Runs a program inside the guest and returns its exit code.
    async fn run_in_guest(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> CpResult<i32>;

    /// Copies a host file into the guest filesystem.
    async fn copy_to_guest(&self, host_path: &Path, guest_path: &str) -> CpResult<()>;

    /// Copies a guest file back to the host filesystem.
    async fn copy_from_guest(&self, guest_path: &str, host_path: &Path) -> CpResult<()>;

    /// Lists the names of all snapshots the VM has.
    async fn list_snapshots(&self) -> CpResult<BTreeSet<String>>;

    /// Reverts the VM to the named snapshot. The VM must be powered off.
    async fn revert_snapshot(&self, name: &str) -> CpResult<()>;

    /// Creates a directory (and parents) inside the guest if absent.
    async fn ensure_guest_dir(&self, path: &str) -> CpResult<()>;
}
