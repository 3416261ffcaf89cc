//! Stage descriptors, handles and the executor seam.
//!
//! This module provides:
//! - Parsed stage descriptors and build definitions
//! - The per-stage handle the coordinator registers at admission
//! - The trait implemented by the engine that runs a single stage

mod descriptor;
mod executor;
mod handle;

pub use descriptor::{BuildDefinition, Instruction, StageDescriptor};
pub use executor::{CanonicalReference, StageExecutor, StageOutput};
pub use handle::StageHandle;
