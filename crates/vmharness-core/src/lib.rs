//! # vmharness-core
//!
//! Orchestration core for vmharness.
//!
//! This crate provides:
//! - The snapshot preparation state machine (clean VM state before a task)
//! - The action registry and task runner (declarative setup, total dispatch)
//! - The evaluation coordinator (host → guest → host verdict round trip)
//! - Run sessions, the orchestrator worker, and the exclusive VM lease
//! - Retry with exponential backoff and jitter for the flaky control plane
//! - Configuration, run artifacts, and an in-memory fake for testing

pub mod actions;
mod artifacts;
mod cancel;
pub mod config;
mod evaluation;
mod lease;
mod orchestrator;
mod retry;
mod runner;
mod session;
mod snapshot;
pub mod testing;

pub use actions::{ActionError, ActionHandler, ActionRegistry, Dispatch, GuestContext};
pub use artifacts::{ArtifactError, RunArtifacts, RunOutcome};
pub use cancel::CancelFlag;
pub use config::{ConfigError, GuestConfig, HarnessConfig, RetryConfig, TimeoutConfig};
pub use evaluation::{EvalError, EvaluationCoordinator};
pub use lease::{LeaseGuard, VmLease};
pub use orchestrator::{OperatorCommand, Orchestrator, OrchestratorError, RunEnded, RunHandle};
pub use retry::{RetryError, RetryObserver, RetryPolicy};
pub use runner::{RunnerError, TaskRunner};
pub use session::{RunSession, SessionHandle, SessionSnapshot};
pub use snapshot::{PrepPhase, PrepareError, SnapshotStateMachine};
