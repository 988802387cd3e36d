//! The host → guest → host evaluation round trip.
//!
//! Copies the task descriptor into the guest, invokes the in-guest evaluator,
//! retrieves its result file, and parses it strictly. A missing, timed-out,
//! or malformed result is an indeterminate outcome (`EvalError::Verdict`),
//! reported as such; it is never assumed to be a pass and never collapsed
//! into a false verdict.

use crate::actions::GuestContext;
use crate::artifacts::RunArtifacts;
use crate::config::guest_join;
use crate::retry::{RetryError, RetryPolicy};
use crate::runner::{RunnerError, TaskRunner};
use tracing::{info, warn};
use vmharness_proto::{ControlPlaneError, Task, Verdict};

/// Guest filename of the serialized descriptor.
const TASK_FILE: &str = "task.json";
/// Guest filename the evaluator writes its result to.
const RESULT_FILE: &str = "result.json";

/// Drives one evaluation round trip.
#[derive(Debug)]
pub struct EvaluationCoordinator {
    retry: RetryPolicy,
}

impl EvaluationCoordinator {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    /// Evaluates a completed task.
    ///
    /// Postconfig actions (if any) run first with the ordinary runner
    /// semantics. The descriptor persisted to the run directory is the
    /// exact payload shipped to the guest.
    pub async fn evaluate(
        &self,
        task: &Task,
        runner: &TaskRunner,
        ctx: &GuestContext,
        artifacts: &RunArtifacts,
    ) -> Result<Verdict, EvalError> {
        let evaluator = task.evaluator.as_ref().ok_or(EvalError::NoEvaluator)?;

        if !evaluator.postconfig.is_empty() {
            info!(
                count = evaluator.postconfig.len(),
                "running postconfig actions before evaluation"
            );
            ctx.status.message("running evaluator postconfig actions");
            runner.run(&evaluator.postconfig, ctx).await?;
        }

        let host_task = artifacts.write_task(task)?;
        let guest_task = guest_join(&ctx.guest_run_dir, TASK_FILE);
        let guest_result = guest_join(&ctx.guest_run_dir, RESULT_FILE);

        // Both the evaluator install dir (scripts, logs) and this run's task
        // dir must exist before anything is copied in.
        self.retry
            .run_transient("ensure_guest_dir", || {
                ctx.control.ensure_guest_dir(&ctx.guest.evaluator_dir)
            })
            .await?;
        self.retry
            .run_transient("ensure_guest_dir", || {
                ctx.control.ensure_guest_dir(&ctx.guest_run_dir)
            })
            .await?;
        self.retry
            .run_transient("copyFileFromHostToGuest", || {
                ctx.control.copy_to_guest(&host_task, &guest_task)
            })
            .await?;

        self.invoke_evaluator(evaluator_command(ctx), &guest_task, &guest_result, ctx)
            .await?;

        self.retrieve_result(&guest_result, ctx, artifacts).await?;

        let bytes = artifacts
            .read_result_bytes()
            .map_err(|err| EvalError::verdict(format!("result file unreadable: {err}")))?;
        parse_verdict(&bytes)
    }

    /// Invokes the guest evaluator. Anything that stops a verdict from being
    /// produced here (timeout, spawn failure) is indeterminate, not a
    /// transport error: the evaluator may have half-run.
    async fn invoke_evaluator(
        &self,
        command: (String, Vec<String>),
        guest_task: &str,
        guest_result: &str,
        ctx: &GuestContext,
    ) -> Result<(), EvalError> {
        let (program, mut args) = command;
        args.push("--task".to_string());
        args.push(guest_task.to_string());
        args.push("--out".to_string());
        args.push(guest_result.to_string());

        info!(program, "invoking guest evaluator");
        ctx.status.message("running in-guest evaluator");

        match ctx
            .control
            .run_in_guest(&program, &args, ctx.timeouts.evaluation())
            .await
        {
            // By contract the evaluator exits non-zero on a false verdict;
            // the result file decides, not the exit code.
            Ok(code) => {
                if code != 0 {
                    warn!(code, "guest evaluator exited non-zero");
                }
                Ok(())
            }
            Err(err) => Err(EvalError::verdict(format!(
                "evaluator produced no verdict: {err}"
            ))),
        }
    }

    /// Copies the result file back. The guest writes it atomically (temp
    /// path + rename), so a retrieved file is never half-written; a missing
    /// one means the evaluation produced nothing.
    async fn retrieve_result(
        &self,
        guest_result: &str,
        ctx: &GuestContext,
        artifacts: &RunArtifacts,
    ) -> Result<(), EvalError> {
        let host_result = artifacts.result_path();
        self.retry
            .run_transient("copyFileFromGuestToHost", || {
                ctx.control.copy_from_guest(guest_result, &host_result)
            })
            .await
            .map_err(|err| {
                EvalError::verdict(format!("result file could not be retrieved: {err}"))
            })
    }
}

fn evaluator_command(ctx: &GuestContext) -> (String, Vec<String>) {
    match ctx.guest.evaluator_command.split_first() {
        Some((program, leading)) => (program.clone(), leading.to_vec()),
        None => (String::new(), Vec::new()),
    }
}

/// Strict verdict parsing: a payload missing `passed` (or unparseable at
/// all) is indeterminate, never a default.
fn parse_verdict(bytes: &[u8]) -> Result<Verdict, EvalError> {
    serde_json::from_slice(bytes).map_err(|err| {
        EvalError::verdict(format!("malformed verdict payload: {err}"))
    })
}

/// Why an evaluation produced no verdict.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// The task carries no evaluator spec; there is nothing to run.
    #[error("task has no evaluator")]
    NoEvaluator,

    /// A postconfig action failed; evaluation never started.
    #[error("postconfig failed: {0}")]
    Postconfig(#[from] RunnerError),

    /// Shipping the descriptor into the guest failed past retries.
    #[error(transparent)]
    Transport(#[from] RetryError<ControlPlaneError>),

    /// Persisting run artifacts failed.
    #[error(transparent)]
    Artifacts(#[from] crate::artifacts::ArtifactError),

    /// The round trip completed without a usable verdict: indeterminate,
    /// explicitly distinct from a true negative verdict.
    #[error("no usable verdict: {detail}")]
    Verdict { detail: String },
}

impl EvalError {
    fn verdict(detail: impl Into<String>) -> Self {
        Self::Verdict {
            detail: detail.into(),
        }
    }

    /// True for the indeterminate outcome.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, Self::Verdict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionRegistry;
    use crate::artifacts::RunArtifacts;
    use crate::cancel::CancelFlag;
    use crate::config::HarnessConfig;
    use crate::testing::FakeControlPlane;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use vmharness_proto::{RunId, StatusPublisher};

    struct Fixture {
        coordinator: EvaluationCoordinator,
        runner: TaskRunner,
        ctx: GuestContext,
        artifacts: Arc<RunArtifacts>,
        _tmp: tempfile::TempDir,
    }

    fn fixture(fake: &Arc<FakeControlPlane>) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let run = RunId::from_raw("20260101_120000_t1");
        let artifacts = Arc::new(RunArtifacts::create(tmp.path(), &run).unwrap());
        let retry = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2));
        let ctx = GuestContext::new(
            Arc::clone(fake) as Arc<dyn vmharness_proto::ControlPlane>,
            &HarnessConfig::default(),
            StatusPublisher::detached(),
            Arc::clone(&artifacts),
            &run,
        );
        Fixture {
            coordinator: EvaluationCoordinator::new(retry.clone()),
            runner: TaskRunner::new(Arc::new(ActionRegistry::builtin()), retry, CancelFlag::new()),
            ctx,
            artifacts,
            _tmp: tmp,
        }
    }

    fn task(postconfig: serde_json::Value) -> Task {
        serde_json::from_value(json!({
            "id": "t1",
            "instruction": "enable do not track",
            "evaluator": {
                "func": "enable_do_not_track",
                "expected": {"rules": {"expected": "true"}},
                "postconfig": postconfig
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_passed_verdict_round_trip() {
        let fake = Arc::new(FakeControlPlane::new().with_evaluator_result(
            br#"{"passed": true, "details": {"evaluator_type": "exact_match"}}"#,
        ));
        let fx = fixture(&fake);

        let verdict = fx
            .coordinator
            .evaluate(&task(json!([])), &fx.runner, &fx.ctx, &fx.artifacts)
            .await
            .unwrap();

        assert!(verdict.passed);
        // raw result bytes persisted for the bookkeeping layer
        let raw = fx.artifacts.read_result_bytes().unwrap();
        assert_eq!(
            raw,
            br#"{"passed": true, "details": {"evaluator_type": "exact_match"}}"#
        );
        // descriptor shipped to the guest matches what was persisted
        let guest_task = fake
            .guest_file(&format!("{}\\task.json", fx.ctx.guest_run_dir))
            .unwrap();
        let back: Task = serde_json::from_slice(&guest_task).unwrap();
        assert_eq!(back.id, "t1");
    }

    #[tokio::test]
    async fn test_failed_verdict_is_a_verdict() {
        let fake = Arc::new(
            FakeControlPlane::new()
                .with_evaluator_result(br#"{"passed": false, "details": {"error": "tab missing"}}"#)
                .with_guest_exit_code(1),
        );
        let fx = fixture(&fake);

        let verdict = fx
            .coordinator
            .evaluate(&task(json!([])), &fx.runner, &fx.ctx, &fx.artifacts)
            .await
            .unwrap();
        assert!(!verdict.passed);
        assert_eq!(verdict.details["error"], "tab missing");
    }

    #[tokio::test]
    async fn test_evaluator_timeout_is_indeterminate() {
        let fake = Arc::new(FakeControlPlane::new().with_evaluator_timeout());
        let fx = fixture(&fake);

        let err = fx
            .coordinator
            .evaluate(&task(json!([])), &fx.runner, &fx.ctx, &fx.artifacts)
            .await
            .unwrap_err();
        assert!(err.is_indeterminate(), "expected indeterminate, got {err:?}");
    }

    #[tokio::test]
    async fn test_missing_result_file_is_indeterminate() {
        // evaluator "runs" but never writes its result file
        let fake = Arc::new(FakeControlPlane::new());
        let fx = fixture(&fake);

        let err = fx
            .coordinator
            .evaluate(&task(json!([])), &fx.runner, &fx.ctx, &fx.artifacts)
            .await
            .unwrap_err();
        match &err {
            EvalError::Verdict { detail } => {
                assert!(detail.contains("could not be retrieved"), "{detail}");
            }
            other => panic!("expected Verdict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_result_is_indeterminate() {
        let fake = Arc::new(FakeControlPlane::new().with_evaluator_result(br#"{"details": {}}"#));
        let fx = fixture(&fake);

        let err = fx
            .coordinator
            .evaluate(&task(json!([])), &fx.runner, &fx.ctx, &fx.artifacts)
            .await
            .unwrap_err();
        assert!(err.is_indeterminate());
    }

    #[tokio::test]
    async fn test_no_evaluator() {
        let fake = Arc::new(FakeControlPlane::new());
        let fx = fixture(&fake);
        let task: Task =
            serde_json::from_value(json!({"id": "t", "instruction": "manual only"})).unwrap();

        let err = fx
            .coordinator
            .evaluate(&task, &fx.runner, &fx.ctx, &fx.artifacts)
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::NoEvaluator));
    }

    #[tokio::test]
    async fn test_postconfig_runs_before_descriptor_copy() {
        let fake = Arc::new(FakeControlPlane::new().with_evaluator_result(
            br#"{"passed": true, "details": {}}"#,
        ));
        let fx = fixture(&fake);

        let task = task(json!([{"type": "launch", "parameters": {"command": ["chrome"]}}]));
        fx.coordinator
            .evaluate(&task, &fx.runner, &fx.ctx, &fx.artifacts)
            .await
            .unwrap();

        let calls = fake.calls();
        let launch = calls
            .iter()
            .position(|c| c == "runProgramInGuest")
            .unwrap();
        let copy = calls
            .iter()
            .position(|c| c == "copyFileFromHostToGuest")
            .unwrap();
        assert!(launch < copy, "postconfig must precede the descriptor copy");
    }
}
