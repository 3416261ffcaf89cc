//! Assertions over build results.

use crate::errors::BuildError;

/// Asserts that `err` is, or wraps, a failure of the stage called `stage`.
pub fn assert_stage_failed(err: &BuildError, stage: &str) {
    assert!(
        failed_stage(err) == Some(stage),
        "Expected failure of stage '{stage}', got: {err}"
    );
}

/// Asserts that `err` is, or wraps, a cancellation.
pub fn assert_cancelled(err: &BuildError) {
    let cancelled = match err {
        BuildError::CleanupFailed { source, .. } => source.is_cancelled(),
        other => other.is_cancelled(),
    };
    assert!(cancelled, "Expected cancellation, got: {err}");
}

fn failed_stage(err: &BuildError) -> Option<&str> {
    match err {
        BuildError::StageExecution { stage, .. } => Some(stage.as_str()),
        BuildError::Context { source, .. } | BuildError::CleanupFailed { source, .. } => {
            failed_stage(source)
        }
        _ => None,
    }
}
