//! Built-in action handlers.

use super::{ActionError, ActionHandler, GuestContext};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};
use vmharness_proto::Action;

/// `launch`: starts a program in the guest.
///
/// The `command` parameter is a program name or an argv list; host-style
/// names (`chrome`, `notepad`) are translated to guest paths through the
/// configured program map.
pub struct LaunchHandler;

#[async_trait]
impl ActionHandler for LaunchHandler {
    async fn execute(&self, action: &Action, ctx: &GuestContext) -> Result<(), ActionError> {
        let (program, args) = parse_command(action)?;
        let program = ctx.guest.resolve_program(&program).to_string();

        info!(program, ?args, "launching program in guest");
        let code = ctx
            .control
            .run_in_guest(&program, &args, ctx.timeouts.guest_command())
            .await?;

        // Many guest programs exit non-zero while still doing their job
        // (chrome handing off to an existing instance); log, don't fail.
        if code != 0 {
            warn!(program, code, "launched program exited non-zero");
            ctx.status
                .message(format!("{program} exited with code {code}"));
        }
        Ok(())
    }
}

fn parse_command(action: &Action) -> Result<(String, Vec<String>), ActionError> {
    match action.parameters.get("command") {
        Some(Value::String(command)) if !command.is_empty() => {
            Ok((command.clone(), Vec::new()))
        }
        Some(Value::Array(items)) if !items.is_empty() => {
            let mut argv = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(s) => argv.push(s.to_string()),
                    None => {
                        return Err(ActionError::bad_parameters(
                            &action.kind,
                            "'command' list entries must be strings",
                        ));
                    }
                }
            }
            let program = argv.remove(0);
            Ok((program, argv))
        }
        Some(_) => Err(ActionError::bad_parameters(
            &action.kind,
            "'command' must be a non-empty string or list of strings",
        )),
        None => Err(ActionError::bad_parameters(
            &action.kind,
            "missing 'command' parameter",
        )),
    }
}

/// `sleep`: suspends the orchestrator for the given duration.
///
/// Host-side on purpose: the wait is for the guest to settle, not for any
/// guest-side process.
pub struct SleepHandler;

#[async_trait]
impl ActionHandler for SleepHandler {
    async fn execute(&self, action: &Action, _ctx: &GuestContext) -> Result<(), ActionError> {
        let seconds = match action.parameters.get("seconds") {
            None => 1.0,
            Some(value) => value.as_f64().filter(|s| *s >= 0.0).ok_or_else(|| {
                ActionError::bad_parameters(
                    &action.kind,
                    "'seconds' must be a non-negative number",
                )
            })?,
        };

        info!(seconds, "sleeping");
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        Ok(())
    }
}

/// `chrome_open_tabs`: opens each URL in a Chrome tab.
///
/// One guest invocation per URL with a short stagger so the guest's process
/// launcher is not flooded.
pub struct ChromeOpenTabsHandler;

/// Delay between consecutive tab launches.
const TAB_STAGGER: Duration = Duration::from_secs(1);

#[async_trait]
impl ActionHandler for ChromeOpenTabsHandler {
    async fn execute(&self, action: &Action, ctx: &GuestContext) -> Result<(), ActionError> {
        let urls = match action.parameters.get("urls_to_open") {
            Some(Value::Array(items)) => {
                let mut urls = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_str() {
                        Some(url) => urls.push(url.to_string()),
                        None => {
                            return Err(ActionError::bad_parameters(
                                &action.kind,
                                "'urls_to_open' entries must be strings",
                            ));
                        }
                    }
                }
                urls
            }
            Some(_) => {
                return Err(ActionError::bad_parameters(
                    &action.kind,
                    "'urls_to_open' must be a list of strings",
                ));
            }
            None => Vec::new(),
        };

        if urls.is_empty() {
            warn!("chrome_open_tabs has no URLs to open");
            return Ok(());
        }

        let chrome = ctx.guest.resolve_program("chrome").to_string();
        let powershell = ctx.guest.powershell().to_string();

        for (i, url) in urls.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(TAB_STAGGER).await;
            }
            info!(url, "opening URL in Chrome");
            let command =
                format!("Start-Process -FilePath '{chrome}' -ArgumentList '{url}'");
            ctx.control
                .run_in_guest(
                    &powershell,
                    &["-Command".to_string(), command],
                    ctx.timeouts.guest_command(),
                )
                .await?;
        }
        Ok(())
    }

    /// A partial re-run would reopen tabs already opened.
    fn retry_safe(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::RunArtifacts;
    use crate::config::HarnessConfig;
    use crate::testing::FakeControlPlane;
    use serde_json::json;
    use std::sync::Arc;
    use vmharness_proto::{RunId, StatusPublisher};

    fn context(fake: &Arc<FakeControlPlane>, tmp: &tempfile::TempDir) -> GuestContext {
        let run = RunId::from_raw("20260101_120000_t1");
        let artifacts = Arc::new(RunArtifacts::create(tmp.path(), &run).unwrap());
        GuestContext::new(
            Arc::clone(fake) as Arc<dyn vmharness_proto::ControlPlane>,
            &HarnessConfig::default(),
            StatusPublisher::detached(),
            artifacts,
            &run,
        )
    }

    #[tokio::test]
    async fn test_launch_translates_program_name() {
        let fake = Arc::new(FakeControlPlane::new());
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(&fake, &tmp);

        let action = Action::new("launch").with_param("command", json!(["chrome"]));
        LaunchHandler.execute(&action, &ctx).await.unwrap();

        let programs = fake.programs_run();
        assert_eq!(programs.len(), 1);
        assert!(programs[0].0.ends_with("chrome.exe"));
    }

    #[tokio::test]
    async fn test_launch_passes_args_through() {
        let fake = Arc::new(FakeControlPlane::new());
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(&fake, &tmp);

        let action = Action::new("launch")
            .with_param("command", json!(["notepad", "C:\\notes.txt"]));
        LaunchHandler.execute(&action, &ctx).await.unwrap();

        let (program, args) = fake.programs_run().remove(0);
        assert!(program.ends_with("notepad.exe"));
        assert_eq!(args, vec!["C:\\notes.txt"]);
    }

    #[tokio::test]
    async fn test_launch_nonzero_exit_is_not_an_error() {
        let fake = Arc::new(FakeControlPlane::new().with_guest_exit_code(3));
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(&fake, &tmp);

        let action = Action::new("launch").with_param("command", json!("chrome"));
        LaunchHandler.execute(&action, &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_launch_missing_command_is_typed_error() {
        let fake = Arc::new(FakeControlPlane::new());
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(&fake, &tmp);

        let err = LaunchHandler
            .execute(&Action::new("launch"), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::BadParameters { .. }));
        assert!(fake.programs_run().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_waits_given_seconds() {
        let fake = Arc::new(FakeControlPlane::new());
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(&fake, &tmp);

        let started = tokio::time::Instant::now();
        let action = Action::new("sleep").with_param("seconds", json!(2));
        SleepHandler.execute(&action, &ctx).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_sleep_rejects_negative() {
        let fake = Arc::new(FakeControlPlane::new());
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(&fake, &tmp);

        let action = Action::new("sleep").with_param("seconds", json!(-1));
        let err = SleepHandler.execute(&action, &ctx).await.unwrap_err();
        assert!(matches!(err, ActionError::BadParameters { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_tabs_one_invocation_per_url() {
        let fake = Arc::new(FakeControlPlane::new());
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(&fake, &tmp);

        let action = Action::new("chrome_open_tabs").with_param(
            "urls_to_open",
            json!(["https://a.example", "https://b.example"]),
        );
        ChromeOpenTabsHandler.execute(&action, &ctx).await.unwrap();

        let programs = fake.programs_run();
        assert_eq!(programs.len(), 2);
        assert!(programs[0].0.ends_with("powershell.exe"));
        assert!(programs[0].1[1].contains("https://a.example"));
        assert!(programs[1].1[1].contains("https://b.example"));
    }

    #[tokio::test]
    async fn test_open_tabs_not_retry_safe() {
        assert!(!ChromeOpenTabsHandler.retry_safe());
        assert!(LaunchHandler.retry_safe());
    }
}
