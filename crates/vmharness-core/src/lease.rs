//! Exclusive VM session lease.
//!
//! The VM is a single-writer resource: exactly one pipeline may address it
//! for the whole of prepare → run → evaluate. The lease is an explicit
//! object handed to the orchestrator, not ambient global state, so tests
//! can use their own and a future multi-VM setup gets one lease per VM.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Lease over one VM.
#[derive(Debug, Clone)]
pub struct VmLease {
    slot: Arc<Semaphore>,
}

impl Default for VmLease {
    fn default() -> Self {
        Self::new()
    }
}

impl VmLease {
    /// Creates a free lease.
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Tries to take the lease; `None` if a run already holds it.
    ///
    /// The guard is held for the duration of the run and released on drop,
    /// whether the pipeline completed or died on a terminal error.
    pub fn try_acquire(&self) -> Option<LeaseGuard> {
        match Arc::clone(&self.slot).try_acquire_owned() {
            Ok(permit) => Some(LeaseGuard { _permit: permit }),
            Err(TryAcquireError::NoPermits) => None,
            // The semaphore is never closed while the lease exists.
            Err(TryAcquireError::Closed) => None,
        }
    }

    /// Whether the lease is currently held.
    pub fn is_held(&self) -> bool {
        self.slot.available_permits() == 0
    }
}

/// Proof of exclusive VM access; release is drop.
#[derive(Debug)]
pub struct LeaseGuard {
    _permit: OwnedSemaphorePermit,
}
