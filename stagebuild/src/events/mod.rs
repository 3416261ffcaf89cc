//! Build lifecycle events.
//!
//! The coordinator emits one event per build and stage transition. Payloads
//! are small JSON objects carrying the stage name and index, or the error.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// A build started dispatching stages.
pub const BUILD_STARTED: &str = "build.started";
/// A stage acquired its admission permit and started.
pub const STAGE_STARTED: &str = "stage.started";
/// A stage produced an image.
pub const STAGE_COMPLETED: &str = "stage.completed";
/// A stage failed.
pub const STAGE_FAILED: &str = "stage.failed";
/// A non-fatal problem was reported.
pub const BUILD_WARNING: &str = "build.warning";
/// The cleanup phase finished.
pub const BUILD_CLEANUP: &str = "build.cleanup";
/// The build finished successfully.
pub const BUILD_COMPLETED: &str = "build.completed";
/// The build failed.
pub const BUILD_FAILED: &str = "build.failed";
