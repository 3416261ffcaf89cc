//! Build configuration.
//!
//! Options are consumed once, when a [`BuildCoordinator`] is constructed.
//! Loading them from flags or files belongs to the caller; this module only
//! defines the shape, the defaults and validation.
//!
//! [`BuildCoordinator`]: crate::coordinator::BuildCoordinator

use crate::errors::BuildError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Build arguments that may be supplied without a matching `ARG` instruction.
pub const BUILTIN_ALLOWED_BUILD_ARGS: &[&str] = &[
    "HTTP_PROXY",
    "http_proxy",
    "HTTPS_PROXY",
    "https_proxy",
    "FTP_PROXY",
    "ftp_proxy",
    "NO_PROXY",
    "no_proxy",
];

/// Returns true if `name` is one of the conventional proxy arguments.
#[must_use]
pub fn is_builtin_build_arg(name: &str) -> bool {
    BUILTIN_ALLOWED_BUILD_ARGS.contains(&name)
}

/// What happens to the containers a stage leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerRetention {
    /// Remove intermediate containers whether or not their stage succeeded.
    ForceRemove,
    /// Remove intermediate containers of stages that succeeded.
    #[default]
    RemoveOnSuccess,
    /// Keep every intermediate container.
    Keep,
}

impl ContainerRetention {
    /// Returns true if containers are removed even when their stage fails.
    #[must_use]
    pub fn is_forced(self) -> bool {
        matches!(self, Self::ForceRemove)
    }

    /// Returns true if containers of successful stages are removed.
    #[must_use]
    pub fn removes_on_success(self) -> bool {
        !matches!(self, Self::Keep)
    }
}

/// Options recognized by the build coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Maximum number of stages executing at once; 0 means one per stage.
    #[serde(default = "default_jobs")]
    pub jobs: i64,
    /// Keep per-stage layers (and therefore intermediate images) around.
    #[serde(default)]
    pub layers: bool,
    /// Ignore any cached layers.
    ///
    /// Read by stage executors through
    /// [`StageContext::options`](crate::coordinator::StageContext::options).
    /// The coordinator itself does not consult it.
    #[serde(default)]
    pub no_cache: bool,
    /// Squash the final image into a single layer.
    ///
    /// Read by stage executors, like `no_cache`.
    #[serde(default)]
    pub squash: bool,
    /// Intermediate container retention policy.
    #[serde(default)]
    pub container_retention: ContainerRetention,
    /// Build argument values.
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    /// Name given to the image produced by the last stage.
    #[serde(default)]
    pub output: String,
    /// Additional names to attach to the output image.
    #[serde(default)]
    pub additional_tags: Vec<String>,
    /// File to write the final image ID to instead of the primary output.
    #[serde(default)]
    pub iidfile: Option<PathBuf>,
    /// Suppress progress and warning output.
    #[serde(default)]
    pub quiet: bool,
}

fn default_jobs() -> i64 {
    1
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            layers: false,
            no_cache: false,
            squash: false,
            container_retention: ContainerRetention::default(),
            args: BTreeMap::new(),
            output: String::new(),
            additional_tags: Vec::new(),
            iidfile: None,
            quiet: false,
        }
    }
}

impl BuildOptions {
    /// Creates options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses options from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, BuildError> {
        let options: Self =
            serde_json::from_str(json).map_err(|e| BuildError::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Sets the concurrency budget.
    #[must_use]
    pub fn with_jobs(mut self, jobs: i64) -> Self {
        self.jobs = jobs;
        self
    }

    /// Enables or disables layer retention.
    #[must_use]
    pub fn with_layers(mut self, layers: bool) -> Self {
        self.layers = layers;
        self
    }

    /// Sets the container retention policy.
    #[must_use]
    pub fn with_container_retention(mut self, retention: ContainerRetention) -> Self {
        self.container_retention = retention;
        self
    }

    /// Adds a build argument.
    #[must_use]
    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    /// Sets the output image name.
    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    /// Adds an extra name for the output image.
    #[must_use]
    pub fn with_additional_tag(mut self, tag: impl Into<String>) -> Self {
        self.additional_tags.push(tag.into());
        self
    }

    /// Sets the image ID file.
    #[must_use]
    pub fn with_iidfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.iidfile = Some(path.into());
        self
    }

    /// Enables quiet mode.
    #[must_use]
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Validates the options.
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.jobs < 0 {
            return Err(BuildError::InvalidJobs { jobs: self.jobs });
        }
        Ok(())
    }

    /// Returns the number of admission permits for a build of `stage_count` stages.
    ///
    /// Never more than one per stage, since extra permits can never be taken.
    pub fn effective_jobs(&self, stage_count: usize) -> Result<usize, BuildError> {
        self.validate()?;
        let stage_count = stage_count.max(1);
        match usize::try_from(self.jobs) {
            Ok(0) => Ok(stage_count),
            Ok(jobs) => Ok(jobs.min(stage_count)),
            // Wider than usize but non-negative.
            Err(_) => Ok(stage_count),
        }
    }

    /// Returns true if intermediate containers must be removed whatever the outcome.
    #[must_use]
    pub fn removes_containers_unconditionally(&self) -> bool {
        self.container_retention.is_forced() || !self.layers
    }
}
