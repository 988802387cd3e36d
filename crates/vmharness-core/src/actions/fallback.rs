//! The generic fallback handler.
//!
//! Serializes the whole action to the run directory, ships it into the
//! guest, and hands it to the in-guest interpreter, which knows how to
//! execute arbitrary declarative operations. This makes dispatch total for
//! any action kind a task may carry.

use super::{ActionError, ActionHandler, GuestContext};
use crate::config::guest_join;
use async_trait::async_trait;
use tracing::info;
use vmharness_proto::Action;

pub struct GenericHandler;

#[async_trait]
impl ActionHandler for GenericHandler {
    async fn execute(&self, action: &Action, ctx: &GuestContext) -> Result<(), ActionError> {
        let payload = serde_json::to_value(action)
            .map_err(|err| ActionError::bad_parameters(&action.kind, err.to_string()))?;
        let host_path = ctx.artifacts.stage_action(ctx.index, &action.kind, &payload)?;

        let actions_dir = guest_join(&ctx.guest_run_dir, "actions");
        let guest_path = guest_join(
            &actions_dir,
            &host_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("{}_{}.json", ctx.index, action.kind)),
        );

        ctx.control.ensure_guest_dir(&actions_dir).await?;
        ctx.control.copy_to_guest(&host_path, &guest_path).await?;

        info!(kind = %action.kind, guest_path, "dispatching action to in-guest interpreter");

        let command = &ctx.guest.generic_runner_command;
        let (program, leading) = command
            .split_first()
            .ok_or_else(|| {
                ActionError::bad_parameters(&action.kind, "generic runner command not configured")
            })?;
        let mut args: Vec<String> = leading.to_vec();
        args.push("--action".to_string());
        args.push(guest_path);

        let code = ctx
            .control
            .run_in_guest(program, &args, ctx.timeouts.guest_command())
            .await?;
        if code == 0 {
            Ok(())
        } else {
            Err(ActionError::Interpreter { code })
        }
    }

    /// The interpreter's side effects are unknown, so a re-run cannot be
    /// assumed safe.
    fn retry_safe(&self) -> bool {
        false
    }
}
