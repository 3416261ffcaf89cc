//! Per-stage runner handles.

use super::StageDescriptor;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

/// The coordinator's record of one started stage.
///
/// A handle is created exactly once per stage, when the stage is admitted.
/// The stage executor mutates its caches and container list while the stage
/// runs; the cleanup phase reads them after the stage has terminated.
pub struct StageHandle {
    descriptor: Arc<StageDescriptor>,
    total_stages: usize,
    output: String,
    volume_cache: Mutex<HashMap<String, String>>,
    container_ids: Mutex<Vec<String>>,
    admission: Mutex<Option<OwnedSemaphorePermit>>,
}

impl StageHandle {
    /// Creates a handle for a stage out of `total_stages`.
    ///
    /// `output` is the image name the stage commits to, and is only
    /// non-empty for the last stage.
    #[must_use]
    pub fn new(
        descriptor: Arc<StageDescriptor>,
        total_stages: usize,
        output: impl Into<String>,
    ) -> Self {
        Self {
            descriptor,
            total_stages,
            output: output.into(),
            volume_cache: Mutex::new(HashMap::new()),
            container_ids: Mutex::new(Vec::new()),
            admission: Mutex::new(None),
        }
    }

    /// Returns the stage descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    /// Returns the stage position.
    #[must_use]
    pub fn index(&self) -> usize {
        self.descriptor.position()
    }

    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    /// Returns the number of stages in the build.
    #[must_use]
    pub fn total_stages(&self) -> usize {
        self.total_stages
    }

    /// Returns the declared output name.
    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Returns true for the last stage of the build.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.index() + 1 == self.total_stages
    }

    /// Records a container created while running this stage.
    pub fn record_container(&self, container_id: impl Into<String>) {
        self.container_ids.lock().push(container_id.into());
    }

    /// Returns the containers recorded so far.
    #[must_use]
    pub fn container_ids(&self) -> Vec<String> {
        self.container_ids.lock().clone()
    }

    /// Takes the recorded containers, leaving the list empty.
    pub(crate) fn take_container_ids(&self) -> Vec<String> {
        std::mem::take(&mut *self.container_ids.lock())
    }

    /// Remembers the cache key under which a volume's contents were saved.
    pub fn cache_volume(&self, path: impl Into<String>, key: impl Into<String>) {
        self.volume_cache.lock().insert(path.into(), key.into());
    }

    /// Returns the cache key of a saved volume.
    #[must_use]
    pub fn cached_volume(&self, path: &str) -> Option<String> {
        self.volume_cache.lock().get(path).cloned()
    }

    pub(crate) fn hold_admission(&self, permit: OwnedSemaphorePermit) {
        *self.admission.lock() = Some(permit);
    }

    /// Gives the admission permit back to the gate. Returns false if none was held.
    pub(crate) fn release_admission(&self) -> bool {
        self.admission.lock().take().is_some()
    }

    /// Returns true while the stage holds an admission permit.
    #[must_use]
    pub fn holds_admission(&self) -> bool {
        self.admission.lock().is_some()
    }
}

impl std::fmt::Debug for StageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageHandle")
            .field("index", &self.index())
            .field("name", &self.name())
            .field("total_stages", &self.total_stages)
            .field("output", &self.output)
            .field("containers", &self.container_ids.lock().len())
            .field("holds_admission", &self.holds_admission())
            .finish()
    }
}
