//! In-memory `ControlPlane` fake.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use vmharness_proto::{ControlPlane, ControlPlaneError, CpResult};

#[derive(Default)]
struct FakeState {
    running: bool,
    snapshots: BTreeSet<String>,
    guest_files: HashMap<String, Vec<u8>>,
    guest_dirs: BTreeSet<String>,
    calls: Vec<String>,
    reverts: Vec<String>,
    programs_run: Vec<(String, Vec<String>)>,
    scripted_failures: HashMap<String, VecDeque<ControlPlaneError>>,
    guest_exit_code: i32,
    evaluator_result: Option<Vec<u8>>,
    evaluator_times_out: bool,
    revert_always_fails: bool,
    power_off_ignored: bool,
}

/// Scriptable fake VM.
///
/// Copies are loopback: `copy_to_guest` stores the host file's bytes under
/// the guest path, `copy_from_guest` writes them back out, so descriptor
/// round trips can be checked byte for byte. When a `run_in_guest` call
/// carries `--out` (the evaluator contract) the configured result bytes are
/// "written" by the fake guest at that path.
pub struct FakeControlPlane {
    state: Mutex<FakeState>,
}

impl Default for FakeControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn with_snapshots<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().unwrap().snapshots = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_running(self, running: bool) -> Self {
        self.state.lock().unwrap().running = running;
        self
    }

    /// Exit code returned by every `run_in_guest` call.
    pub fn with_guest_exit_code(self, code: i32) -> Self {
        self.state.lock().unwrap().guest_exit_code = code;
        self
    }

    /// Bytes the fake guest evaluator writes to its `--out` path.
    pub fn with_evaluator_result(self, bytes: impl AsRef<[u8]>) -> Self {
        self.state.lock().unwrap().evaluator_result = Some(bytes.as_ref().to_vec());
        self
    }

    /// Makes evaluator invocations time out instead of completing.
    pub fn with_evaluator_timeout(self) -> Self {
        self.state.lock().unwrap().evaluator_times_out = true;
        self
    }

    /// Makes every revert attempt fail with a transient error.
    pub fn failing_revert(self) -> Self {
        self.state.lock().unwrap().revert_always_fails = true;
        self
    }

    /// Accepts `power_off` but leaves the VM running (hung guest shutdown).
    pub fn ignoring_power_off(self) -> Self {
        self.state.lock().unwrap().power_off_ignored = true;
        self
    }

    /// Queues a failure returned by the next call to `operation`.
    pub fn push_failure(&self, operation: &str, error: ControlPlaneError) {
        self.state
            .lock()
            .unwrap()
            .scripted_failures
            .entry(operation.to_string())
            .or_default()
            .push_back(error);
    }

    /// Pre-populates a guest file (for copy-from-guest tests).
    pub fn put_guest_file(&self, path: &str, bytes: impl AsRef<[u8]>) {
        self.state
            .lock()
            .unwrap()
            .guest_files
            .insert(path.to_string(), bytes.as_ref().to_vec());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn reverts(&self) -> Vec<String> {
        self.state.lock().unwrap().reverts.clone()
    }

    pub fn programs_run(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().programs_run.clone()
    }

    pub fn guest_file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().guest_files.get(path).cloned()
    }

    pub fn guest_dirs(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().guest_dirs.clone()
    }

    pub fn is_running_now(&self) -> bool {
        self.state.lock().unwrap().running
    }

    fn record(&self, operation: &str) -> Result<(), ControlPlaneError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(operation.to_string());
        if let Some(queue) = state.scripted_failures.get_mut(operation) {
            if let Some(err) = queue.pop_front() {
                return Err(err);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn power_on(&self, _fullscreen: bool) -> CpResult<()> {
        self.record("start")?;
        self.state.lock().unwrap().running = true;
        Ok(())
    }

    async fn power_off(&self) -> CpResult<()> {
        self.record("stop")?;
        let mut state = self.state.lock().unwrap();
        if !state.power_off_ignored {
            state.running = false;
        }
        Ok(())
    }

    async fn is_running(&self) -> CpResult<bool> {
        self.record("list")?;
        Ok(self.state.lock().unwrap().running)
    }

    async fn run_in_guest(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> CpResult<i32> {
        self.record("runProgramInGuest")?;
        let mut state = self.state.lock().unwrap();
        state
            .programs_run
            .push((program.to_string(), args.to_vec()));

        // Evaluator contract: `--out <path>` names the result file.
        if let Some(flag) = args.iter().position(|a| a == "--out") {
            if state.evaluator_times_out {
                return Err(ControlPlaneError::timed_out("runProgramInGuest", timeout));
            }
            if let (Some(out_path), Some(result)) =
                (args.get(flag + 1), state.evaluator_result.clone())
            {
                state.guest_files.insert(out_path.clone(), result);
            }
        }

        Ok(state.guest_exit_code)
    }

    async fn copy_to_guest(&self, host_path: &Path, guest_path: &str) -> CpResult<()> {
        self.record("copyFileFromHostToGuest")?;
        let bytes = std::fs::read(host_path).map_err(|err| {
            ControlPlaneError::fatal(
                "copyFileFromHostToGuest",
                format!("cannot find host file {}: {err}", host_path.display()),
            )
        })?;
        self.state
            .lock()
            .unwrap()
            .guest_files
            .insert(guest_path.to_string(), bytes);
        Ok(())
    }

    async fn copy_from_guest(&self, guest_path: &str, host_path: &Path) -> CpResult<()> {
        self.record("copyFileFromGuestToHost")?;
        let bytes = self
            .state
            .lock()
            .unwrap()
            .guest_files
            .get(guest_path)
            .cloned()
            .ok_or_else(|| {
                ControlPlaneError::fatal(
                    "copyFileFromGuestToHost",
                    format!("cannot find guest file {guest_path}"),
                )
            })?;
        std::fs::write(host_path, bytes).map_err(|err| {
            ControlPlaneError::fatal("copyFileFromGuestToHost", err.to_string())
        })?;
        Ok(())
    }

    async fn list_snapshots(&self) -> CpResult<BTreeSet<String>> {
        self.record("listSnapshots")?;
        Ok(self.state.lock().unwrap().snapshots.clone())
    }

    async fn revert_snapshot(&self, name: &str) -> CpResult<()> {
        self.record("revertToSnapshot")?;
        let mut state = self.state.lock().unwrap();
        if state.running {
            return Err(ControlPlaneError::precondition(
                "revertToSnapshot",
                "the virtual machine is powered on",
            ));
        }
        if state.revert_always_fails {
            return Err(ControlPlaneError::transient(
                "revertToSnapshot",
                "the hypervisor is busy",
            ));
        }
        if !state.snapshots.contains(name) {
            return Err(ControlPlaneError::fatal(
                "revertToSnapshot",
                format!("cannot find snapshot {name}"),
            ));
        }
        state.reverts.push(name.to_string());
        Ok(())
    }

    async fn ensure_guest_dir(&self, path: &str) -> CpResult<()> {
        self.record("ensure_guest_dir")?;
        self.state
            .lock()
            .unwrap()
            .guest_dirs
            .insert(path.to_string());
        Ok(())
    }
}
