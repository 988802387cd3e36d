//! Bounded external process execution.
//!
//! All control-plane commands funnel through `run_with_timeout`, which spawns
//! one process with piped stdio, waits no longer than the given deadline, and
//! reaps the child if the deadline passes. The caller decides what a timeout
//! means for its specific operation.

use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Captured output of a completed command.
#[derive(Debug)]
pub struct CommandOutput {
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Captured stdout, lossily decoded.
    pub stdout: String,
    /// Captured stderr, lossily decoded.
    pub stderr: String,
}

impl CommandOutput {
    /// True if the process exited with code zero.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// The most useful diagnostic text: stderr if non-empty, else stdout.
    ///
    /// vmrun reports some errors on stdout ("Error: The virtual machine...").
    pub fn diagnostic(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }
}

/// Outcome of a bounded execution.
#[derive(Debug)]
pub enum ExecOutcome {
    /// The process exited before the deadline.
    Completed(CommandOutput),
    /// The deadline passed; the child was killed and reaped.
    TimedOut,
}

/// Runs `program` with `args`, waiting at most `timeout`.
///
/// On timeout the child is killed so no zombie is left behind; whether that
/// timeout is transient or fatal is the caller's classification to make.
pub(crate) async fn run_with_timeout(
    program: impl AsRef<OsStr>,
    args: &[String],
    timeout: Duration,
) -> std::io::Result<ExecOutcome> {
    let program = program.as_ref();
    debug!(program = ?program, ?args, timeout_secs = timeout.as_secs(), "spawning control-plane command");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output?;
            Ok(ExecOutcome::Completed(CommandOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }))
        }
        Err(_) => {
            // wait_with_output consumed the child; kill_on_drop already
            // reaped it when the future was dropped by the timeout.
            Ok(ExecOutcome::TimedOut)
        }
    }
}

/// Spawns `program` detached, without waiting for it to exit.
///
/// Used for the `vmware -X` fullscreen front-end, which stays alive for as
/// long as the VM window is open. Liveness is confirmed by polling the
/// control plane afterwards, not by this process handle.
pub(crate) fn spawn_detached(
    program: impl AsRef<OsStr>,
    args: &[String],
) -> std::io::Result<()> {
    let program = program.as_ref();
    debug!(program = ?program, ?args, "spawning detached front-end");

    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completed_with_output() {
        let outcome = run_with_timeout("echo", &["hello".to_string()], Duration::from_secs(5))
            .await
            .unwrap();
        match outcome {
            ExecOutcome::Completed(output) => {
                assert!(output.success());
                assert!(output.stdout.contains("hello"));
            }
            ExecOutcome::TimedOut => panic!("echo should not time out"),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit() {
        let outcome = run_with_timeout("false", &[], Duration::from_secs(5))
            .await
            .unwrap();
        match outcome {
            ExecOutcome::Completed(output) => {
                assert!(!output.success());
                assert_eq!(output.exit_code, Some(1));
            }
            ExecOutcome::TimedOut => panic!("false should not time out"),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let outcome = run_with_timeout("sleep", &["10".to_string()], Duration::from_millis(100))
            .await
            .unwrap();
        assert!(matches!(outcome, ExecOutcome::TimedOut));
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let result = run_with_timeout(
            "definitely-not-a-real-binary-xyz",
            &[],
            Duration::from_secs(1),
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_diagnostic_prefers_stderr() {
        let output = CommandOutput {
            exit_code: Some(1),
            stdout: "Error: on stdout\n".to_string(),
            stderr: "real problem\n".to_string(),
        };
        assert_eq!(output.diagnostic(), "real problem");

        let output = CommandOutput {
            exit_code: Some(1),
            stdout: "Error: only stdout\n".to_string(),
            stderr: String::new(),
        };
        assert_eq!(output.diagnostic(), "Error: only stdout");
    }
}
