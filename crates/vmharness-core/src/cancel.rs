//! Cooperative cancellation flag.
//!
//! Control-plane calls cannot be safely interrupted mid-flight (killing a
//! hypervisor operation risks an undefined power/snapshot state), so
//! cancellation is a checkpoint flag consulted between discrete steps, never
//! forced termination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation checkpoint for one run.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation at the next safe boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
