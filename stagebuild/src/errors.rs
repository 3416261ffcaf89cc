//! Error types for stagebuild.
//!
//! Every error is `Clone`: the first stage failure of a build is stored once
//! and handed to every stage still waiting on a dependency.

use std::sync::Arc;
use thiserror::Error;

/// The main error type for build coordination.
#[derive(Debug, Clone, Error)]
pub enum BuildError {
    /// The build definition contained no stages.
    #[error("error building: no stages to build")]
    NoStages,

    /// The concurrency budget was negative.
    #[error("error building: invalid value for jobs ({jobs}); it must be a non-negative integer")]
    InvalidJobs {
        /// The rejected value.
        jobs: i64,
    },

    /// A stage's position does not match its place in the definition.
    #[error("error building: stage {stage:?} at index {index} declares position {position}")]
    StagePosition {
        /// The stage name.
        stage: String,
        /// Where the stage appears in the definition.
        index: usize,
        /// The position the stage declares.
        position: usize,
    },

    /// Build options could not be loaded.
    #[error("invalid build options: {0}")]
    Config(String),

    /// A stage name or position did not match any stage.
    #[error("unknown stage {name:?}")]
    UnknownStage {
        /// The name that was looked up.
        name: String,
    },

    /// A stage has no `FROM` instruction to take its base image from.
    #[error("stage {stage:?} does not name a base image")]
    MissingBase {
        /// The stage name.
        stage: String,
    },

    /// The output name could not be resolved to a storage reference.
    #[error(
        "error parsing target image name {name:?}{}",
        .reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default()
    )]
    ResolveOutput {
        /// The output name.
        name: String,
        /// The underlying resolution failure, if any.
        reason: Option<String>,
    },

    /// A stage failed while executing its instructions.
    #[error("stage {stage:?} failed: {message}")]
    StageExecution {
        /// The stage name.
        stage: String,
        /// The failure message.
        message: String,
    },

    /// The build was cancelled.
    #[error("build cancelled: {0}")]
    Cancelled(String),

    /// An image or container storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// An error annotated with what was being attempted.
    #[error("{context}: {source}")]
    Context {
        /// What was being attempted.
        context: String,
        /// The underlying error.
        source: Box<BuildError>,
    },

    /// Cleanup failed after the build had already produced an outcome.
    #[error("{cleanup}: {source}")]
    CleanupFailed {
        /// The build error that cleanup ran after.
        source: Box<BuildError>,
        /// The last error seen during cleanup.
        cleanup: Box<BuildError>,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BuildError {
    /// Creates a stage execution error.
    #[must_use]
    pub fn stage_failed(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StageExecution {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Creates an unknown stage error.
    #[must_use]
    pub fn unknown_stage(name: impl Into<String>) -> Self {
        Self::UnknownStage { name: name.into() }
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled(reason.into())
    }

    /// Wraps the error with a description of what was being attempted.
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Merges a cleanup failure into this error without replacing it.
    #[must_use]
    pub fn with_cleanup_error(self, cleanup: Self) -> Self {
        Self::CleanupFailed {
            source: Box::new(self),
            cleanup: Box::new(cleanup),
        }
    }

    /// Returns true if this error (or the error it wraps) is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled(_) => true,
            Self::Context { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Returns true if the root cause is an image still referenced by a container.
    #[must_use]
    pub fn is_image_in_use(&self) -> bool {
        match self {
            Self::Storage(err) => err.is_image_in_use(),
            Self::Context { source, .. } => source.is_image_in_use(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for BuildError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// Errors reported by the image/container store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// No image with this ID or name exists.
    #[error("image not known: {0}")]
    ImageNotFound(String),

    /// The image cannot be removed because a container still uses it.
    #[error("image {0} is in use by a container")]
    ImageUsedByContainer(String),

    /// No container with this ID exists.
    #[error("container not known: {0}")]
    ContainerNotFound(String),

    /// Any other storage failure.
    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// Returns true for the "image used by container" condition.
    #[must_use]
    pub fn is_image_in_use(&self) -> bool {
        matches!(self, Self::ImageUsedByContainer(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_wraps_message() {
        let err = BuildError::from(StorageError::ImageNotFound("abc".to_string()))
            .context("error locating just-written image \"out\"");

        assert_eq!(
            err.to_string(),
            "error locating just-written image \"out\": image not known: abc"
        );
    }

    #[test]
    fn test_cleanup_error_keeps_build_error() {
        let build = BuildError::stage_failed("builder", "exit status 1");
        let cleanup = BuildError::from(StorageError::Other("disk busy".to_string()));
        let merged = build.with_cleanup_error(cleanup);

        let message = merged.to_string();
        assert!(message.starts_with("storage error: disk busy"));
        assert!(message.ends_with("stage \"builder\" failed: exit status 1"));
    }

    #[test]
    fn test_image_in_use_through_context() {
        let err = BuildError::from(StorageError::ImageUsedByContainer("abc".to_string()))
            .context("removing intermediate image");
        assert!(err.is_image_in_use());
        assert!(!BuildError::NoStages.is_image_in_use());
    }

    #[test]
    fn test_resolve_output_display() {
        let bare = BuildError::ResolveOutput {
            name: "out".to_string(),
            reason: None,
        };
        assert_eq!(bare.to_string(), "error parsing target image name \"out\"");

        let with_reason = BuildError::ResolveOutput {
            name: "out".to_string(),
            reason: Some("no registries".to_string()),
        };
        assert!(with_reason.to_string().ends_with(": no registries"));
    }

    #[test]
    fn test_is_cancelled() {
        assert!(BuildError::cancelled("stop").is_cancelled());
        assert!(BuildError::cancelled("stop").context("acquiring permit").is_cancelled());
        assert!(!BuildError::unknown_stage("x").is_cancelled());
    }
}
