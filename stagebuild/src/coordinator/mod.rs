//! Concurrent multi-stage build coordination.
//!
//! This module provides:
//! - The [`BuildCoordinator`] that admits, runs and aggregates stages
//! - The [`StageContext`] executors use to wait on and inspect other stages
//! - The [`AdmissionGate`] bounding concurrent stages
//! - The lexical cross-stage reference scan

mod admission;
mod build;
mod cleanup;
mod context;
mod scan;
mod state;


pub use admission::AdmissionGate;
pub use build::{BuildCoordinator, BuildOutput};
pub use cleanup::CleanupReport;
pub use context::StageContext;
pub use scan::{unused_build_args, CrossReferences};
