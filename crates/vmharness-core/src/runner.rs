//! Ordered execution of a task's action sequence.
//!
//! Actions run strictly in the order given; later actions commonly depend on
//! the side effects of earlier ones, so nothing is reordered or parallelized.
//! Each dispatch runs under the retry policy, with retry disabled for
//! handlers that declare themselves non-idempotent. A failure halts the
//! sequence at its index; the operator decides whether to retry that action
//! or skip past it, via `run_from`.

use crate::actions::{ActionError, ActionRegistry, GuestContext};
use crate::cancel::CancelFlag;
use crate::retry::{RetryError, RetryPolicy};
use std::sync::Arc;
use tracing::{info, warn};
use vmharness_proto::{Action, StatusDetail};

/// Executes action sequences against a prepared VM.
pub struct TaskRunner {
    registry: Arc<ActionRegistry>,
    retry: RetryPolicy,
    cancel: CancelFlag,
}

impl TaskRunner {
    pub fn new(registry: Arc<ActionRegistry>, retry: RetryPolicy, cancel: CancelFlag) -> Self {
        Self {
            registry,
            retry,
            cancel,
        }
    }

    /// Runs the whole sequence from the beginning.
    pub async fn run(&self, actions: &[Action], ctx: &GuestContext) -> Result<(), RunnerError> {
        self.run_from(0, actions, ctx).await
    }

    /// Runs the sequence starting at `start`.
    ///
    /// This is the resume point after an action failure: retrying the failed
    /// action re-enters at its index, skipping it re-enters at index + 1.
    pub async fn run_from(
        &self,
        start: usize,
        actions: &[Action],
        ctx: &GuestContext,
    ) -> Result<(), RunnerError> {
        for (index, action) in actions.iter().enumerate().skip(start) {
            // Cancellation is cooperative: checked between actions, never
            // interrupting an in-flight guest call.
            if self.cancel.is_cancelled() {
                info!(index, "cancellation requested, halting before next action");
                return Err(RunnerError::Cancelled { index });
            }

            self.dispatch(index, actions.len(), action, ctx).await?;
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        index: usize,
        total: usize,
        action: &Action,
        ctx: &GuestContext,
    ) -> Result<(), RunnerError> {
        let dispatch = self.registry.resolve(&action.kind);

        ctx.status.publish(StatusDetail::ActionStarted {
            index,
            total,
            kind: action.kind.clone(),
        });
        if dispatch.via_fallback {
            warn!(kind = %action.kind, index, "no dedicated handler, using generic fallback");
            ctx.status.publish(StatusDetail::FallbackUsed {
                index,
                kind: action.kind.clone(),
            });
        }

        let action_ctx = ctx.for_action(index);
        let handler = dispatch.handler;
        let retry_safe = handler.retry_safe();
        let label = format!("action[{index}]:{}", action.kind);

        let result = self
            .retry
            .run(
                &label,
                |err: &ActionError| retry_safe && err.is_transient(),
                || handler.execute(action, &action_ctx),
            )
            .await;

        match result {
            Ok(()) => {
                ctx.status.publish(StatusDetail::ActionCompleted {
                    index,
                    kind: action.kind.clone(),
                });
                Ok(())
            }
            Err(source) => {
                ctx.status.publish(StatusDetail::ActionFailed {
                    index,
                    kind: action.kind.clone(),
                    error: source.to_string(),
                });
                Err(RunnerError::ActionFailed {
                    index,
                    kind: action.kind.clone(),
                    source,
                })
            }
        }
    }
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Why an action sequence halted.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The action at `index` failed after its retry budget.
    #[error("action {index} ('{kind}') failed: {source}")]
    ActionFailed {
        index: usize,
        kind: String,
        #[source]
        source: RetryError<ActionError>,
    },

    /// Cancellation was requested; the sequence stopped before `index`.
    #[error("run cancelled before action {index}")]
    Cancelled { index: usize },
}

impl RunnerError {
    /// Index of the action the sequence halted on (or before).
    pub fn index(&self) -> usize {
        match self {
            Self::ActionFailed { index, .. } | Self::Cancelled { index } => *index,
        }
    }
}
