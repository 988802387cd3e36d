//! The run orchestrator.
//!
//! `start_task` ties one task to one run: it takes the VM lease, creates the
//! session and artifact directory, and spawns the pipeline on a worker task
//! so the caller's thread is never blocked on a hypervisor call. Progress
//! flows out through the status bus; operator decisions flow in through the
//! returned handle's command channel.

use crate::actions::{ActionRegistry, GuestContext};
use crate::artifacts::{ArtifactError, RunArtifacts, RunOutcome};
use crate::cancel::CancelFlag;
use crate::config::HarnessConfig;
use crate::evaluation::{EvalError, EvaluationCoordinator};
use crate::lease::{LeaseGuard, VmLease};
use crate::retry::RetryPolicy;
use crate::runner::{RunnerError, TaskRunner};
use crate::session::{RunSession, SessionHandle, SessionSnapshot};
use crate::snapshot::SnapshotStateMachine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use vmharness_proto::{
    ControlPlane, RunId, RunPhase, StatusBus, StatusDetail, StatusEvent, StatusPublisher, Task,
    TaskError,
};

/// Operator decisions fed into a running pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    /// The human finished the task; run the evaluation round trip.
    Evaluate,
    /// Re-run the action the sequence halted on.
    RetryAction,
    /// Skip the halted action and continue with the next one.
    SkipAction,
    /// Abort the run at the next safe boundary.
    Cancel,
}

/// Orchestrates task runs against one VM.
pub struct Orchestrator {
    control: Arc<dyn ControlPlane>,
    config: HarnessConfig,
    registry: Arc<ActionRegistry>,
    bus: Arc<StatusBus>,
    lease: VmLease,
}

impl Orchestrator {
    pub fn new(control: Arc<dyn ControlPlane>, config: HarnessConfig) -> Self {
        Self {
            control,
            config,
            registry: Arc::new(ActionRegistry::builtin()),
            bus: Arc::new(StatusBus::new()),
            lease: VmLease::new(),
        }
    }

    /// Replaces the action registry (custom or extended handler sets).
    pub fn with_registry(mut self, registry: ActionRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// The status bus runs publish into.
    pub fn status_bus(&self) -> Arc<StatusBus> {
        Arc::clone(&self.bus)
    }

    /// Registers a status observer (GUI, log sink).
    pub fn add_observer<F>(&self, observer: F)
    where
        F: Fn(&StatusEvent) + Send + 'static,
    {
        self.bus.add_observer(observer);
    }

    /// Whether a run currently holds the VM.
    pub fn is_busy(&self) -> bool {
        self.lease.is_held()
    }

    /// Starts a run for `task`.
    ///
    /// Rejects the request if another run holds the VM lease; queueing would
    /// hide staleness from the operator. Returns a handle the GUI layer uses
    /// to observe the session and feed operator decisions in.
    pub fn start_task(&self, task: Task) -> Result<RunHandle, OrchestratorError> {
        task.validate()?;

        let guard = self.lease.try_acquire().ok_or(OrchestratorError::VmBusy)?;
        let run = RunId::new(&task.id);
        info!(run = %run, task = %task.id, "starting task run");

        let artifacts = Arc::new(RunArtifacts::create(&self.config.output_dir, &run)?);
        artifacts.write_task(&task)?;

        let session = SessionHandle::new(RunSession::new(run.clone(), &task.id));
        self.mirror_status_into_session(&session, &run);

        let status = StatusPublisher::new(Arc::clone(&self.bus), run.clone());
        let cancel = CancelFlag::new();
        let (commands_tx, commands_rx) = mpsc::channel(16);

        let ctx = GuestContext::new(
            Arc::clone(&self.control),
            &self.config,
            status.clone(),
            Arc::clone(&artifacts),
            &run,
        );

        let pipeline = Pipeline {
            task,
            config: self.config.clone(),
            control: Arc::clone(&self.control),
            registry: Arc::clone(&self.registry),
            session: session.clone(),
            status,
            ctx,
            artifacts,
            cancel: cancel.clone(),
            commands: commands_rx,
        };
        let join = tokio::spawn(pipeline.run(guard));

        Ok(RunHandle {
            session,
            commands: commands_tx,
            cancel,
            join,
        })
    }

    /// Every status line published for this run is also appended to the
    /// session's log, so snapshots carry the full history.
    fn mirror_status_into_session(&self, session: &SessionHandle, run: &RunId) {
        let session = session.clone();
        let run = run.clone();
        self.bus.add_observer(move |event| {
            if event.run == run {
                session.update(|s| s.append(&event.detail.to_string()));
            }
        });
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("busy", &self.is_busy())
            .finish_non_exhaustive()
    }
}

/// Handle to one in-flight (or finished) run.
#[derive(Debug)]
pub struct RunHandle {
    session: SessionHandle,
    commands: mpsc::Sender<OperatorCommand>,
    cancel: CancelFlag,
    join: JoinHandle<()>,
}

impl RunHandle {
    /// A point-in-time copy of the session.
    pub fn session(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    /// The shared session handle, for observers that poll.
    pub fn session_handle(&self) -> SessionHandle {
        self.session.clone()
    }

    /// Whether the pipeline has reached a terminal phase.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Asks the pipeline to evaluate the task.
    pub async fn request_evaluate(&self) -> Result<(), RunEnded> {
        self.send(OperatorCommand::Evaluate).await
    }

    /// Asks the pipeline to re-run the action it halted on.
    pub async fn request_retry(&self) -> Result<(), RunEnded> {
        self.send(OperatorCommand::RetryAction).await
    }

    /// Asks the pipeline to skip the halted action.
    pub async fn request_skip(&self) -> Result<(), RunEnded> {
        self.send(OperatorCommand::SkipAction).await
    }

    /// Requests cancellation at the next safe boundary.
    ///
    /// Sets the cooperative flag (honored between actions) and nudges the
    /// command loop for runs parked on an operator decision. An in-flight
    /// guest call is never interrupted.
    pub fn cancel(&self) {
        self.cancel.cancel();
        let _ = self.commands.try_send(OperatorCommand::Cancel);
    }

    async fn send(&self, command: OperatorCommand) -> Result<(), RunEnded> {
        self.commands.send(command).await.map_err(|_| RunEnded)
    }

    /// Waits for the pipeline to finish and returns the final session state.
    pub async fn wait(self) -> SessionSnapshot {
        if let Err(err) = self.join.await {
            error!(%err, "run worker task failed");
        }
        self.session.snapshot()
    }
}

/// The run this handle refers to has already reached a terminal phase.
#[derive(Debug, thiserror::Error)]
#[error("the run has already ended")]
pub struct RunEnded;

/// Errors starting a run.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Another run holds the VM lease.
    #[error("a task run already holds the VM")]
    VmBusy,

    /// The task descriptor failed defensive validation.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// The run directory could not be created or written.
    #[error(transparent)]
    Artifacts(#[from] ArtifactError),
}

/// What the decision loop resolved to.
enum Decision {
    Retry,
    Skip,
    Cancel,
}

/// The worker side of one run: prepare → actions → operator → evaluation.
struct Pipeline {
    task: Task,
    config: HarnessConfig,
    control: Arc<dyn ControlPlane>,
    registry: Arc<ActionRegistry>,
    session: SessionHandle,
    status: StatusPublisher,
    ctx: GuestContext,
    artifacts: Arc<RunArtifacts>,
    cancel: CancelFlag,
    commands: mpsc::Receiver<OperatorCommand>,
}

impl Pipeline {
    /// Runs the pipeline to a terminal phase, then records the outcome and
    /// releases the lease.
    async fn run(mut self, lease: LeaseGuard) {
        let terminal = self.execute().await;
        self.set_phase(terminal);

        let snapshot = self.session.snapshot();
        let outcome = RunOutcome {
            run: snapshot.id,
            task_id: snapshot.task_id,
            phase: terminal,
            verdict: snapshot.verdict,
            error: snapshot.error,
        };
        if let Err(err) = self.artifacts.write_outcome(&outcome) {
            warn!(%err, "failed to write run outcome artifact");
        }

        drop(lease);
    }

    async fn execute(&mut self) -> RunPhase {
        let retry = self.retry_policy();

        // Preparation: verified snapshot, observed shutdown, revert, start.
        self.set_phase(RunPhase::Preparing);
        let machine = {
            let machine = SnapshotStateMachine::new(
                Arc::clone(&self.control),
                retry.clone(),
                self.config.timeouts.clone(),
                self.status.clone(),
            );
            if self.config.use_snapshots {
                machine
            } else {
                machine.with_snapshots_disabled()
            }
        };
        let snapshot = self.task.snapshot_or(&self.config.snapshot_name).to_string();
        if let Err(err) = machine.prepare(&snapshot, self.config.start_fullscreen).await {
            error!(%err, "VM preparation failed");
            self.fail(format!("preparation failed: {err}"));
            return RunPhase::Failed;
        }

        if self.cancel.is_cancelled() {
            return RunPhase::Cancelled;
        }

        let runner = TaskRunner::new(
            Arc::clone(&self.registry),
            retry.clone(),
            self.cancel.clone(),
        );

        // Setup actions, with the operator arbitrating failures.
        self.set_phase(RunPhase::RunningActions);
        let mut start = 0;
        loop {
            let outcome = runner.run_from(start, &self.task.config, &self.ctx).await;
            match outcome {
                Ok(()) => break,
                Err(RunnerError::Cancelled { .. }) => return RunPhase::Cancelled,
                Err(err @ RunnerError::ActionFailed { .. }) => {
                    let failed = err.index();
                    error!(%err, index = failed, "action sequence halted");
                    self.set_phase(RunPhase::AwaitingDecision);
                    match self.await_decision().await {
                        Decision::Retry => {
                            self.status
                                .message(format!("retrying action {}", failed + 1));
                            start = failed;
                        }
                        Decision::Skip => {
                            self.status
                                .message(format!("skipping action {}", failed + 1));
                            start = failed + 1;
                        }
                        Decision::Cancel => return RunPhase::Cancelled,
                    }
                    self.set_phase(RunPhase::RunningActions);
                }
            }
        }

        // The human drives the guest until they ask for evaluation.
        self.set_phase(RunPhase::WaitingForOperator);
        self.status
            .message("setup complete; perform the task, then request evaluation");
        loop {
            match self.commands.recv().await {
                Some(OperatorCommand::Evaluate) => break,
                Some(OperatorCommand::Cancel) | None => return RunPhase::Cancelled,
                Some(OperatorCommand::RetryAction | OperatorCommand::SkipAction) => {
                    self.status.message("no action is awaiting a decision");
                }
            }
        }

        self.set_phase(RunPhase::Evaluating);
        let coordinator = EvaluationCoordinator::new(retry);
        match coordinator
            .evaluate(&self.task, &runner, &self.ctx, &self.artifacts)
            .await
        {
            Ok(verdict) => {
                self.status.publish(StatusDetail::Verdict {
                    passed: verdict.passed,
                });
                self.session.update(|s| s.record_verdict(verdict));
                RunPhase::Completed
            }
            Err(EvalError::NoEvaluator) => {
                self.status
                    .message("task has no evaluator; completing without a verdict");
                RunPhase::Completed
            }
            Err(EvalError::Postconfig(RunnerError::Cancelled { .. })) => RunPhase::Cancelled,
            Err(err) if err.is_indeterminate() => {
                // Indeterminate is not a negative verdict; the run failed to
                // produce one at all.
                error!(%err, "evaluation produced no verdict");
                self.fail(format!("evaluation indeterminate: {err}"));
                RunPhase::Failed
            }
            Err(err) => {
                error!(%err, "evaluation round trip failed");
                self.fail(format!("evaluation failed: {err}"));
                RunPhase::Failed
            }
        }
    }

    /// Parks until the operator picks retry, skip, or cancel.
    async fn await_decision(&mut self) -> Decision {
        loop {
            match self.commands.recv().await {
                Some(OperatorCommand::RetryAction) => return Decision::Retry,
                Some(OperatorCommand::SkipAction) => return Decision::Skip,
                Some(OperatorCommand::Cancel) | None => return Decision::Cancel,
                Some(OperatorCommand::Evaluate) => {
                    self.status
                        .message("an action is awaiting a decision; retry or skip it first");
                }
            }
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        let status = self.status.clone();
        RetryPolicy::from_config(&self.config.retry).with_observer(Arc::new(
            move |operation: &str, attempt: u32, delay: Duration| {
                status.publish(StatusDetail::Retry {
                    operation: operation.to_string(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
            },
        ))
    }

    fn set_phase(&self, phase: RunPhase) {
        self.session.update(|s| s.set_phase(phase));
        self.status.publish(StatusDetail::Phase(phase));
    }

    fn fail(&self, message: String) {
        self.status.message(message.clone());
        self.session.update(|s| s.record_error(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeControlPlane;

    fn config(tmp: &tempfile::TempDir) -> HarnessConfig {
        let mut config = HarnessConfig::default();
        config.output_dir = tmp.path().to_path_buf();
        config.timeouts.poll_interval_ms = 5;
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 4;
        config
    }

    fn task() -> Task {
        serde_json::from_value(serde_json::json!({
            "id": "t1",
            "instruction": "do the thing",
            "snapshot": "clean"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_second_start_rejected_while_leased() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeControlPlane::new().with_snapshots(["clean"]));
        let orchestrator = Orchestrator::new(fake, config(&tmp));

        let handle = orchestrator.start_task(task()).unwrap();
        let err = orchestrator.start_task(task()).unwrap_err();
        assert!(matches!(err, OrchestratorError::VmBusy));

        handle.cancel();
        let snapshot = handle.wait().await;
        assert_eq!(snapshot.phase, RunPhase::Cancelled);

        // lease released; a new run may start
        assert!(!orchestrator.is_busy());
    }

    #[tokio::test]
    async fn test_invalid_task_rejected_before_lease() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeControlPlane::new());
        let orchestrator = Orchestrator::new(fake, config(&tmp));

        let bad: Task =
            serde_json::from_value(serde_json::json!({"id": "", "instruction": "x"})).unwrap();
        let err = orchestrator.start_task(bad).unwrap_err();
        assert!(matches!(err, OrchestratorError::Task(_)));
        assert!(!orchestrator.is_busy());
    }

    #[tokio::test]
    async fn test_preparation_failure_is_terminal() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeControlPlane::new().with_snapshots(["base"]));
        let orchestrator = Orchestrator::new(fake, config(&tmp));

        let snapshot = orchestrator.start_task(task()).unwrap().wait().await;
        assert_eq!(snapshot.phase, RunPhase::Failed);
        let error = snapshot.error.unwrap();
        assert!(error.contains("'clean' not found"), "{error}");
        assert!(error.contains("base"), "available names missing: {error}");
    }
}
