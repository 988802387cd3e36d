//! Action handlers and the dispatch registry.
//!
//! Action kinds are open strings: tasks ship new kinds faster than this crate
//! grows handlers for them. The registry maps known kinds to dedicated
//! handlers and routes everything else to the generic fallback, which ships
//! the action into the guest for the in-guest interpreter. Dispatch is
//! therefore total; no action kind aborts a run by being unrecognized.

mod builtin;
mod fallback;

pub use builtin::{ChromeOpenTabsHandler, LaunchHandler, SleepHandler};
pub use fallback::GenericHandler;

use crate::artifacts::{ArtifactError, RunArtifacts};
use crate::config::{guest_join, GuestConfig, HarnessConfig, TimeoutConfig};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use vmharness_proto::{Action, ControlPlane, ControlPlaneError, RunId, StatusPublisher};

/// Everything a handler needs to act on the live VM session.
#[derive(Clone)]
pub struct GuestContext {
    pub control: Arc<dyn ControlPlane>,
    pub guest: GuestConfig,
    pub timeouts: TimeoutConfig,
    pub status: StatusPublisher,
    pub artifacts: Arc<RunArtifacts>,
    /// Guest directory holding this run's task files.
    pub guest_run_dir: String,
    /// Position of the action currently executing, set by the runner.
    pub index: usize,
}

impl GuestContext {
    pub fn new(
        control: Arc<dyn ControlPlane>,
        config: &HarnessConfig,
        status: StatusPublisher,
        artifacts: Arc<RunArtifacts>,
        run: &RunId,
    ) -> Self {
        Self {
            control,
            guest: config.guest.clone(),
            timeouts: config.timeouts.clone(),
            status,
            artifacts,
            guest_run_dir: guest_join(&config.guest.task_dir, run.as_str()),
            index: 0,
        }
    }

    /// A copy of this context positioned at `index`.
    pub(crate) fn for_action(&self, index: usize) -> Self {
        let mut ctx = self.clone();
        ctx.index = index;
        ctx
    }
}

impl std::fmt::Debug for GuestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestContext")
            .field("guest_run_dir", &self.guest_run_dir)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// One executable action kind.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Executes the action against the guest.
    async fn execute(&self, action: &Action, ctx: &GuestContext) -> Result<(), ActionError>;

    /// Whether a transient failure of this handler may be retried.
    ///
    /// Handlers whose side effects would double-apply on a re-run (append to
    /// a file, open browser tabs) return false here, which disables retry
    /// for that specific action.
    fn retry_safe(&self) -> bool {
        true
    }
}

/// A handler failure, classified for the retry policy.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// Parameters did not deserialize to the shape the handler expects.
    #[error("invalid parameters for '{kind}': {detail}")]
    BadParameters { kind: String, detail: String },

    /// The underlying control-plane call failed.
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),

    /// The in-guest interpreter refused the action.
    #[error("generic interpreter exited with code {code}")]
    Interpreter { code: i32 },

    /// Staging the action payload on the host failed.
    #[error(transparent)]
    Stage(#[from] ArtifactError),
}

impl ActionError {
    pub fn bad_parameters(kind: &str, detail: impl Into<String>) -> Self {
        Self::BadParameters {
            kind: kind.to_string(),
            detail: detail.into(),
        }
    }

    /// Retry-eligible failures: transient control-plane trouble only. Bad
    /// parameters and interpreter refusals will not improve on a re-run.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ControlPlane(err) if err.is_transient())
    }
}

/// A resolved dispatch target.
pub struct Dispatch {
    pub handler: Arc<dyn ActionHandler>,
    /// True when no dedicated handler matched and the fallback was chosen.
    pub via_fallback: bool,
}

/// Maps action kinds to handlers, with a designated fallback.
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
    fallback: Arc<dyn ActionHandler>,
}

impl ActionRegistry {
    /// The standard registry: built-in handlers plus the generic fallback.
    pub fn builtin() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
            fallback: Arc::new(GenericHandler),
        };
        registry.register("launch", Arc::new(LaunchHandler));
        registry.register("sleep", Arc::new(SleepHandler));
        registry.register("chrome_open_tabs", Arc::new(ChromeOpenTabsHandler));
        registry
    }

    /// Registers (or replaces) the handler for `kind`.
    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(kind.into(), handler);
    }

    /// Replaces the fallback handler.
    pub fn with_fallback(mut self, fallback: Arc<dyn ActionHandler>) -> Self {
        self.fallback = fallback;
        self
    }

    /// Resolves `kind` to a handler; unrecognized kinds get the fallback.
    pub fn resolve(&self, kind: &str) -> Dispatch {
        match self.handlers.get(kind) {
            Some(handler) => Dispatch {
                handler: Arc::clone(handler),
                via_fallback: false,
            },
            None => Dispatch {
                handler: Arc::clone(&self.fallback),
                via_fallback: true,
            },
        }
    }

    /// Registered kinds, for diagnostics.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.kinds().collect();
        kinds.sort_unstable();
        f.debug_struct("ActionRegistry")
            .field("kinds", &kinds)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds_resolve_directly() {
        let registry = ActionRegistry::builtin();
        for kind in ["launch", "sleep", "chrome_open_tabs"] {
            assert!(!registry.resolve(kind).via_fallback, "{kind} hit fallback");
        }
    }

    #[test]
    fn test_unknown_kind_resolves_to_fallback() {
        let registry = ActionRegistry::builtin();
        assert!(registry.resolve("set_wallpaper").via_fallback);
        assert!(registry.resolve("").via_fallback);
    }

    #[test]
    fn test_transient_classification() {
        let transient = ActionError::ControlPlane(ControlPlaneError::transient("op", "busy"));
        assert!(transient.is_transient());

        let fatal = ActionError::ControlPlane(ControlPlaneError::fatal("op", "gone"));
        assert!(!fatal.is_transient());

        assert!(!ActionError::bad_parameters("launch", "missing command").is_transient());
        assert!(!ActionError::Interpreter { code: 2 }.is_transient());
    }
}
