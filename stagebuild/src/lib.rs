//! # Stagebuild
//!
//! Concurrent coordination of multi-stage container image builds.
//!
//! A build description is split into stages, each starting from a base
//! image. Stagebuild runs those stages concurrently with:
//!
//! - **Bounded admission**: at most `jobs` stages execute at once, admitted in declaration order
//! - **Cross-stage waits**: a stage can block on another by alias or position without deadlocking
//! - **First-failure semantics**: the first stage error wins and cancels the rest of the build
//! - **Cleanup**: intermediate containers and images are removed according to policy
//! - **Commit**: unused build argument warnings, extra tags and the final image ID
//!
//! Executing a stage's instructions and storing images are delegated to a
//! [`StageExecutor`](stage::StageExecutor) and an
//! [`ImageStore`](storage::ImageStore).
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stagebuild::prelude::*;
//!
//! let options = BuildOptions::new().with_jobs(0).with_output("app:latest");
//! let coordinator = BuildCoordinator::new(options, store, executor);
//! let output = coordinator.build(&definition).await?;
//! println!("{}", output.image_id);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod observability;
pub mod options;
pub mod stage;
pub mod storage;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{CancellationToken, CleanupGuard};
    pub use crate::coordinator::{BuildCoordinator, BuildOutput, CleanupReport, StageContext};
    pub use crate::errors::{BuildError, StorageError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::init_tracing;
    pub use crate::options::{BuildOptions, ContainerRetention};
    pub use crate::stage::{
        BuildDefinition, CanonicalReference, Instruction, StageDescriptor, StageExecutor,
        StageHandle, StageOutput,
    };
    pub use crate::storage::{
        resolve_output_reference, HistoryEntry, ImageReference, ImageStore, StoredImage,
        Transport,
    };
}

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    #[test]
    fn test_prelude_options_from_json() {
        let options = BuildOptions::from_json(r#"{"jobs": 0, "layers": true}"#).unwrap();
        assert_eq!(options.effective_jobs(3).unwrap(), 3);
        assert!(options.layers);
    }

    #[test]
    fn test_prelude_resolves_output_names() {
        let store = crate::testing::MemoryImageStore::new();
        let reference = tokio_test::block_on(resolve_output_reference(&store, "app")).unwrap();
        assert_eq!(reference.to_string(), "containers-storage:localhost/app");
    }
}
