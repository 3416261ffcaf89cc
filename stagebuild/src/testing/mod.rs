//! Testing utilities for stagebuild.
//!
//! This module provides:
//! - An in-memory image store and a scripted stage executor
//! - Stage fixtures
//! - Assertions over build errors

mod assertions;
pub mod fixtures;
mod mocks;

pub use assertions::{assert_cancelled, assert_stage_failed};
pub use mocks::{MemoryImageStore, ScriptedExecutor, SharedBuffer, StageScript};
