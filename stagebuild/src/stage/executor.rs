//! The stage executor seam.
//!
//! Executing the instructions of a single stage (running commands, copying
//! files, committing layers) is the job of an external engine. The
//! coordinator drives it through [`StageExecutor`].

use super::StageHandle;
use crate::coordinator::StageContext;
use crate::errors::BuildError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

/// A digest-pinned image reference, `name@digest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalReference {
    /// Repository name.
    pub name: String,
    /// Content digest, e.g. `sha256:...`.
    pub digest: String,
}

impl CanonicalReference {
    /// Creates a canonical reference.
    #[must_use]
    pub fn new(name: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            digest: digest.into(),
        }
    }
}

impl fmt::Display for CanonicalReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.digest)
    }
}

/// What a stage produced.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageOutput {
    /// ID of the committed image.
    pub image_id: String,
    /// Canonical reference of the committed image, when it was named.
    pub reference: Option<CanonicalReference>,
}

impl StageOutput {
    /// Creates an output for an unnamed image.
    #[must_use]
    pub fn new(image_id: impl Into<String>) -> Self {
        Self {
            image_id: image_id.into(),
            reference: None,
        }
    }

    /// Sets the canonical reference.
    #[must_use]
    pub fn with_reference(mut self, reference: CanonicalReference) -> Self {
        self.reference = Some(reference);
        self
    }
}

/// Engine that executes the instructions of one stage.
///
/// One executor serves every stage of a build, so implementations keep
/// per-stage state on the [`StageHandle`] rather than on `self`.
#[async_trait]
pub trait StageExecutor: Send + Sync + Debug {
    /// Executes a stage on top of `base`.
    ///
    /// `base` is the literal base image from the stage's `FROM`
    /// instruction. When it names an earlier stage the executor calls
    /// [`StageContext::wait_for_stage`] before using that stage's image.
    async fn execute(&self, ctx: &StageContext, base: &str) -> Result<StageOutput, BuildError>;

    /// Discards any containers the executor created for the stage.
    async fn delete(&self, stage: &StageHandle) -> Result<(), BuildError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_reference_display() {
        let reference = CanonicalReference::new("localhost/app", "sha256:abcd");
        assert_eq!(reference.to_string(), "localhost/app@sha256:abcd");
    }

    #[test]
    fn test_stage_output_builder() {
        let output = StageOutput::new("abcd")
            .with_reference(CanonicalReference::new("localhost/app", "sha256:abcd"));
        assert_eq!(output.image_id, "abcd");
        assert!(output.reference.is_some());
    }
}
