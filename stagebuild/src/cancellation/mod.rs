//! Structured cancellation and cleanup utilities.
//!
//! This module provides:
//! - CancellationToken for cooperative cancellation
//! - CleanupGuard for scope-bound release of resources

mod guard;
mod token;

pub use guard::CleanupGuard;
pub use token::{CancelCallback, CancellationToken};
