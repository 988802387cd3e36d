//! # vmharness-adapters
//!
//! Control-plane adapters for vmharness.
//!
//! This crate implements the `ControlPlane` trait against the VMware
//! Workstation command line (`vmrun`, plus the `vmware` front-end for
//! fullscreen power-on). Each trait method issues exactly one external
//! process invocation under a bounded timeout and classifies the outcome
//! into the shared failure taxonomy.

mod executor;
mod vmrun;

pub use executor::{CommandOutput, ExecOutcome};
pub use vmrun::VmrunClient;
