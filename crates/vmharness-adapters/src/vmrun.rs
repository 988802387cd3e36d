//! `ControlPlane` implementation over the VMware Workstation CLI.
//!
//! Every operation is one `vmrun` invocation (or one `vmware -X` spawn for
//! fullscreen power-on). Exit status and error text are mapped onto the
//! shared taxonomy; the heuristics mirror the strings vmrun actually prints,
//! since it exits non-zero for everything from a busy hypervisor to a
//! missing `.vmx` file.

use crate::executor::{run_with_timeout, spawn_detached, CommandOutput, ExecOutcome};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use vmharness_core::config::{HarnessConfig, TimeoutConfig};
use vmharness_proto::{ControlPlane, ControlPlaneError, CpResult};

/// Control-plane client for one VM, addressed by its `.vmx` path.
#[derive(Debug, Clone)]
pub struct VmrunClient {
    vmrun: PathBuf,
    vmware: PathBuf,
    vmx: String,
    guest_username: String,
    guest_password: String,
    powershell: String,
    timeouts: TimeoutConfig,
}

impl VmrunClient {
    /// Creates a client from the harness configuration.
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            vmrun: config.vmrun_path(),
            vmware: config.vmware_path(),
            vmx: config.vmx_path.clone(),
            guest_username: config.guest_username.clone(),
            guest_password: config.guest_password.clone(),
            powershell: config.guest.powershell().to_string(),
            timeouts: config.timeouts.clone(),
        }
    }

    /// Common argv prefix for operations that authenticate into the guest.
    fn guest_prefix(&self) -> Vec<String> {
        vec![
            "-T".to_string(),
            "ws".to_string(),
            "-gu".to_string(),
            self.guest_username.clone(),
            "-gp".to_string(),
            self.guest_password.clone(),
        ]
    }

    /// Runs one vmrun invocation and classifies the outcome.
    async fn vmrun(
        &self,
        operation: &'static str,
        args: Vec<String>,
        timeout: Duration,
    ) -> CpResult<CommandOutput> {
        let outcome = run_with_timeout(&self.vmrun, &args, timeout)
            .await
            .map_err(|e| spawn_failure(operation, &e))?;

        match outcome {
            ExecOutcome::Completed(output) => {
                if output.success() {
                    Ok(output)
                } else {
                    Err(classify(operation, &output))
                }
            }
            ExecOutcome::TimedOut => Err(ControlPlaneError::timed_out(operation, timeout)),
        }
    }
}

#[async_trait]
impl ControlPlane for VmrunClient {
    async fn power_on(&self, fullscreen: bool) -> CpResult<()> {
        if fullscreen {
            // The vmware front-end stays alive while the VM window is open,
            // so it is spawned detached; callers confirm liveness by polling
            // is_running afterwards.
            info!(vmx = %self.vmx, "starting VM in fullscreen mode");
            spawn_detached(&self.vmware, &["-X".to_string(), self.vmx.clone()])
                .map_err(|e| spawn_failure("vmware -X", &e))?;
            Ok(())
        } else {
            info!(vmx = %self.vmx, "starting VM");
            self.vmrun(
                "start",
                vec!["start".to_string(), self.vmx.clone()],
                self.timeouts.power_on(),
            )
            .await?;
            Ok(())
        }
    }

    async fn power_off(&self) -> CpResult<()> {
        info!(vmx = %self.vmx, "stopping VM");
        let args = |mode: &str| {
            vec![
                "-T".to_string(),
                "ws".to_string(),
                "stop".to_string(),
                self.vmx.clone(),
                mode.to_string(),
            ]
        };

        let outcome = run_with_timeout(&self.vmrun, &args("soft"), self.timeouts.shutdown())
            .await
            .map_err(|e| spawn_failure("stop", &e))?;

        let first = match outcome {
            ExecOutcome::Completed(output) if output.success() => return Ok(()),
            // A timed-out stop may have half-committed inside the guest;
            // re-issuing it risks double application, so it is fatal.
            ExecOutcome::TimedOut => {
                return Err(ControlPlaneError::fatal(
                    "stop",
                    "stop did not complete in time and may be half-applied",
                ));
            }
            ExecOutcome::Completed(output) => classify("stop", &output),
        };

        match first {
            err @ (ControlPlaneError::Precondition { .. } | ControlPlaneError::Fatal { .. }) => {
                Err(err)
            }
            first => {
                // Soft stop refused (guest tools absent or hung); escalate
                // to a hard stop once, as the operator console would.
                warn!(error = %first, "soft stop failed, attempting hard stop");
                self.vmrun("stop", args("hard"), self.timeouts.shutdown())
                    .await
                    .map(|_| ())
            }
        }
    }

    async fn is_running(&self) -> CpResult<bool> {
        let output = self
            .vmrun("list", vec!["list".to_string()], self.timeouts.list())
            .await?;
        Ok(listing_mentions_vm(&output.stdout, &self.vmx))
    }

    async fn run_in_guest(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> CpResult<i32> {
        let mut argv = self.guest_prefix();
        argv.push("runProgramInGuest".to_string());
        argv.push(self.vmx.clone());
        argv.push(program.to_string());
        argv.extend(args.iter().cloned());

        debug!(program, ?args, "running program in guest");

        let outcome = run_with_timeout(&self.vmrun, &argv, timeout)
            .await
            .map_err(|e| spawn_failure("runProgramInGuest", &e))?;

        match outcome {
            ExecOutcome::Completed(output) => {
                let code = output.exit_code.unwrap_or(-1);
                if output.success() {
                    Ok(0)
                } else if looks_like_vmrun_error(&output) {
                    // vmrun itself failed (auth, tools, power state), as
                    // opposed to the guest program exiting non-zero.
                    Err(classify("runProgramInGuest", &output))
                } else {
                    Ok(code)
                }
            }
            ExecOutcome::TimedOut => Err(ControlPlaneError::timed_out(
                "runProgramInGuest",
                timeout,
            )),
        }
    }

    async fn copy_to_guest(&self, host_path: &Path, guest_path: &str) -> CpResult<()> {
        let mut argv = self.guest_prefix();
        argv.push("copyFileFromHostToGuest".to_string());
        argv.push(self.vmx.clone());
        argv.push(host_path.display().to_string());
        argv.push(guest_path.to_string());

        debug!(host = %host_path.display(), guest = guest_path, "copying file to guest");
        self.vmrun("copyFileFromHostToGuest", argv, self.timeouts.copy())
            .await?;
        Ok(())
    }

    async fn copy_from_guest(&self, guest_path: &str, host_path: &Path) -> CpResult<()> {
        let mut argv = self.guest_prefix();
        argv.push("copyFileFromGuestToHost".to_string());
        argv.push(self.vmx.clone());
        argv.push(guest_path.to_string());
        argv.push(host_path.display().to_string());

        debug!(guest = guest_path, host = %host_path.display(), "copying file from guest");
        self.vmrun("copyFileFromGuestToHost", argv, self.timeouts.copy())
            .await?;
        Ok(())
    }

    async fn list_snapshots(&self) -> CpResult<BTreeSet<String>> {
        let output = self
            .vmrun(
                "listSnapshots",
                vec![
                    "-T".to_string(),
                    "ws".to_string(),
                    "listSnapshots".to_string(),
                    self.vmx.clone(),
                ],
                self.timeouts.list(),
            )
            .await?;

        // First line is "Total snapshots: N"; the rest are names.
        Ok(output
            .stdout
            .lines()
            .skip(1)
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn revert_snapshot(&self, name: &str) -> CpResult<()> {
        info!(snapshot = name, "reverting to snapshot");
        self.vmrun(
            "revertToSnapshot",
            vec![
                "-T".to_string(),
                "ws".to_string(),
                "revertToSnapshot".to_string(),
                self.vmx.clone(),
                name.to_string(),
            ],
            self.timeouts.revert(),
        )
        .await?;
        Ok(())
    }

    async fn ensure_guest_dir(&self, path: &str) -> CpResult<()> {
        let command = format!("New-Item -ItemType Directory -Force -Path '{path}'");
        let code = self
            .run_in_guest(
                &self.powershell,
                &["-Command".to_string(), command],
                self.timeouts.guest_command(),
            )
            .await?;
        if code == 0 {
            Ok(())
        } else {
            Err(ControlPlaneError::transient(
                "ensure_guest_dir",
                format!("powershell exited with code {code}"),
            ))
        }
    }
}

/// Maps a spawn-level IO failure onto the taxonomy.
fn spawn_failure(operation: &'static str, err: &std::io::Error) -> ControlPlaneError {
    match err.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            ControlPlaneError::fatal(operation, format!("cannot execute control binary: {err}"))
        }
        _ => ControlPlaneError::transient(operation, format!("spawn failed: {err}")),
    }
}

/// Classifies a non-zero vmrun exit by its error text.
fn classify(operation: &'static str, output: &CommandOutput) -> ControlPlaneError {
    let detail = output.diagnostic().to_string();
    let text = detail.to_lowercase();

    let precondition = [
        "is not powered on",
        "already powered on",
        "powered off",
        "is busy",
        "in use",
        "tools are not running",
    ];
    let fatal = [
        "cannot find",
        "not found",
        "no such",
        "invalid",
        "encrypted",
        "password",
        "cannot open",
        "corrupt",
    ];

    if precondition.iter().any(|needle| text.contains(needle)) {
        ControlPlaneError::precondition(operation, detail)
    } else if fatal.iter().any(|needle| text.contains(needle)) {
        ControlPlaneError::fatal(operation, detail)
    } else {
        // vmrun fails for plenty of self-healing reasons; default to
        // transient so the retry policy gets a chance.
        ControlPlaneError::transient(operation, detail)
    }
}

/// True if a failed `runProgramInGuest` was vmrun's own error rather than a
/// non-zero guest program exit.
fn looks_like_vmrun_error(output: &CommandOutput) -> bool {
    output.diagnostic().to_lowercase().starts_with("error:")
}

/// Checks a `vmrun list` listing for the VM, tolerating path-separator and
/// case differences between the configured path and what vmrun prints.
fn listing_mentions_vm(listing: &str, vmx: &str) -> bool {
    if listing.contains(vmx) {
        return true;
    }
    let normalized = vmx.replace('\\', "/");
    if listing.replace('\\', "/").contains(&normalized) {
        return true;
    }
    if let Some(name) = normalized.rsplit('/').next() {
        if !name.is_empty() && listing.contains(name) {
            return true;
        }
    }
    listing.to_lowercase().contains(&vmx.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(stdout: &str, stderr: &str, code: i32) -> CommandOutput {
        CommandOutput {
            exit_code: Some(code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_classify_precondition() {
        let out = output("", "Error: The virtual machine is not powered on", 255);
        let err = classify("revertToSnapshot", &out);
        assert!(matches!(err, ControlPlaneError::Precondition { .. }));
    }

    #[test]
    fn test_classify_fatal() {
        let out = output("Error: Cannot open VM: vm.vmx is encrypted", "", 255);
        let err = classify("listSnapshots", &out);
        assert!(matches!(err, ControlPlaneError::Fatal { .. }));

        let out = output("", "Error: Invalid user name or password for the guest OS", 255);
        let err = classify("runProgramInGuest", &out);
        assert!(matches!(err, ControlPlaneError::Fatal { .. }));
    }

    #[test]
    fn test_classify_defaults_to_transient() {
        let out = output("", "Error: The operation was canceled", 255);
        let err = classify("start", &out);
        assert!(err.is_transient());
    }

    #[test]
    fn test_listing_matches_direct_and_normalized() {
        let listing = "Total running VMs: 1\nD:/VMs/Win11/Win11.vmx\n";
        assert!(listing_mentions_vm(listing, "D:/VMs/Win11/Win11.vmx"));
        assert!(listing_mentions_vm(listing, "D:\\VMs\\Win11\\Win11.vmx"));
        assert!(!listing_mentions_vm(listing, "D:/VMs/Other/Other.vmx"));
    }

    #[test]
    fn test_listing_matches_basename() {
        let listing = "Total running VMs: 1\nC:\\Users\\op\\VMs\\Win11.vmx\n";
        assert!(listing_mentions_vm(listing, "D:\\staging\\Win11.vmx"));
    }

    #[test]
    fn test_empty_listing() {
        assert!(!listing_mentions_vm("Total running VMs: 0\n", "D:/VMs/Win11/Win11.vmx"));
    }
}
