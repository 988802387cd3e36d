//! Test doubles for the orchestration pipeline.
//!
//! Deterministic in-memory stand-ins replace the live hypervisor so the
//! pipeline can be exercised without a VM: scripted power state, loopback
//! file copies, and injectable failures.

mod fake;

pub use fake::FakeControlPlane;
