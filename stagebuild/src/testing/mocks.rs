//! In-memory collaborators for exercising the coordinator.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::coordinator::StageContext;
use crate::errors::{BuildError, StorageError};
use crate::stage::{CanonicalReference, StageExecutor, StageHandle, StageOutput};
use crate::storage::{content_digest, HistoryEntry, ImageReference, ImageStore, StoredImage};

#[derive(Debug, Default)]
struct StoreState {
    images: HashMap<String, Vec<String>>,
    containers: HashSet<String>,
    in_use: HashSet<String>,
    history: HashMap<String, Vec<HistoryEntry>>,
    failing: HashSet<String>,
    deleted_images: Vec<String>,
    deleted_containers: Vec<String>,
}

/// An image store kept entirely in memory.
///
/// Short names resolve to a single `localhost/` candidate. IDs registered
/// with [`fail_deletion`](Self::fail_deletion) fail to delete.
#[derive(Debug, Default)]
pub struct MemoryImageStore {
    state: Mutex<StoreState>,
}

impl MemoryImageStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an image with the given names.
    pub fn insert_image(&self, id: impl Into<String>, names: &[&str]) {
        self.state
            .lock()
            .images
            .insert(id.into(), names.iter().map(|n| (*n).to_string()).collect());
    }

    /// Adds a container.
    pub fn insert_container(&self, id: impl Into<String>) {
        self.state.lock().containers.insert(id.into());
    }

    /// Marks an image as used by a container, so deleting it fails.
    pub fn mark_in_use(&self, image_id: impl Into<String>) {
        self.state.lock().in_use.insert(image_id.into());
    }

    /// Makes deletions of an image or container fail.
    pub fn fail_deletion(&self, id: impl Into<String>) {
        self.state.lock().failing.insert(id.into());
    }

    /// Sets the history reported for an image.
    pub fn set_history(&self, image_id: impl Into<String>, history: Vec<HistoryEntry>) {
        self.state.lock().history.insert(image_id.into(), history);
    }

    /// Returns the image with this ID.
    #[must_use]
    pub fn image(&self, id: &str) -> Option<StoredImage> {
        self.state.lock().images.get(id).map(|names| StoredImage {
            id: id.to_string(),
            names: names.clone(),
        })
    }

    /// Returns true if a container with this ID exists.
    #[must_use]
    pub fn has_container(&self, id: &str) -> bool {
        self.state.lock().containers.contains(id)
    }

    /// Returns deleted image IDs, in deletion order.
    #[must_use]
    pub fn deleted_images(&self) -> Vec<String> {
        self.state.lock().deleted_images.clone()
    }

    /// Returns deleted container IDs, in deletion order.
    #[must_use]
    pub fn deleted_containers(&self) -> Vec<String> {
        self.state.lock().deleted_containers.clone()
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn delete_image(&self, image_id: &str, _commit: bool) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if state.failing.contains(image_id) {
            return Err(StorageError::Other(format!("deleting image {image_id}: device busy")));
        }
        if state.in_use.contains(image_id) {
            return Err(StorageError::ImageUsedByContainer(image_id.to_string()));
        }
        if state.images.remove(image_id).is_none() {
            return Err(StorageError::ImageNotFound(image_id.to_string()));
        }
        state.deleted_images.push(image_id.to_string());
        Ok(())
    }

    async fn delete_container(&self, container_id: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if state.failing.contains(container_id) {
            return Err(StorageError::Other(format!(
                "deleting container {container_id}: device busy"
            )));
        }
        if !state.containers.remove(container_id) {
            return Err(StorageError::ContainerNotFound(container_id.to_string()));
        }
        state.deleted_containers.push(container_id.to_string());
        Ok(())
    }

    async fn resolve_name(&self, name: &str) -> Result<Vec<String>, StorageError> {
        if name.is_empty() {
            return Ok(Vec::new());
        }
        if name.contains('/') {
            return Ok(vec![name.to_string()]);
        }
        Ok(vec![format!("localhost/{name}")])
    }

    async fn lookup_image(&self, reference: &ImageReference) -> Result<StoredImage, StorageError> {
        let state = self.state.lock();
        state
            .images
            .iter()
            .find(|(id, names)| {
                *id == reference.name() || names.iter().any(|n| n == reference.name())
            })
            .map(|(id, names)| StoredImage {
                id: id.clone(),
                names: names.clone(),
            })
            .ok_or_else(|| StorageError::ImageNotFound(reference.name().to_string()))
    }

    async fn add_names(&self, image_id: &str, names: &[String]) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        let existing = state
            .images
            .get_mut(image_id)
            .ok_or_else(|| StorageError::ImageNotFound(image_id.to_string()))?;
        for name in names {
            if !existing.contains(name) {
                existing.push(name.clone());
            }
        }
        Ok(())
    }

    async fn image_history(&self, image_id: &str) -> Result<Vec<HistoryEntry>, StorageError> {
        let state = self.state.lock();
        if !state.images.contains_key(image_id) {
            return Err(StorageError::ImageNotFound(image_id.to_string()));
        }
        Ok(state.history.get(image_id).cloned().unwrap_or_default())
    }
}

/// How a [`ScriptedExecutor`] runs one stage.
#[derive(Debug, Clone, Default)]
pub struct StageScript {
    image_id: Option<String>,
    failure: Option<String>,
    waits_for: Vec<String>,
    delay: Duration,
    containers: Vec<String>,
    panics: bool,
}

impl StageScript {
    /// Creates a script that succeeds immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Produces this image ID instead of a derived one.
    #[must_use]
    pub fn image_id(mut self, id: impl Into<String>) -> Self {
        self.image_id = Some(id.into());
        self
    }

    /// Fails with this message after any waits and delay.
    #[must_use]
    pub fn fail(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Waits for another stage before doing anything else.
    #[must_use]
    pub fn wait_for(mut self, stage: impl Into<String>) -> Self {
        self.waits_for.push(stage.into());
        self
    }

    /// Sleeps for this long while holding the admission permit.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Creates a build container while running.
    #[must_use]
    pub fn container(mut self, id: impl Into<String>) -> Self {
        self.containers.push(id.into());
        self
    }

    /// Panics instead of finishing.
    #[must_use]
    pub fn panics(mut self) -> Self {
        self.panics = true;
        self
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(active: &'a AtomicUsize, max_active: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        max_active.fetch_max(now, Ordering::SeqCst);
        Self(active)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A stage executor driven by per-stage scripts.
///
/// Stages without a script succeed at once. Scripts are looked up by stage
/// name. It tracks how many stages execute at once, not counting time spent
/// waiting on other stages.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: HashMap<String, StageScript>,
    store: Option<Arc<MemoryImageStore>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    started: Mutex<Vec<String>>,
    finished: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    wait_violations: Mutex<Vec<String>>,
    fail_delete: bool,
}

impl ScriptedExecutor {
    /// Creates an executor where every stage succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Commits produced images and containers into `store`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<MemoryImageStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the script of one stage.
    #[must_use]
    pub fn with_stage(mut self, name: impl Into<String>, script: StageScript) -> Self {
        self.scripts.insert(name.into(), script);
        self
    }

    /// Makes every `delete` call fail.
    #[must_use]
    pub fn failing_delete(mut self) -> Self {
        self.fail_delete = true;
        self
    }

    /// Returns the most stages ever executing at once.
    #[must_use]
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Returns stage names in the order they started executing.
    #[must_use]
    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    /// Returns stage names in the order they finished successfully.
    #[must_use]
    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().clone()
    }

    /// Returns stage names whose containers were discarded.
    #[must_use]
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    /// Returns waits that returned before their target had terminated.
    #[must_use]
    pub fn wait_violations(&self) -> Vec<String> {
        self.wait_violations.lock().clone()
    }

    fn image_id_for(handle: &StageHandle, script: &StageScript) -> String {
        script.image_id.clone().unwrap_or_else(|| {
            content_digest(format!("{}:{}", handle.index(), handle.name()))
        })
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    async fn execute(&self, ctx: &StageContext, _base: &str) -> Result<StageOutput, BuildError> {
        let handle = ctx.handle();
        let name = handle.name().to_string();
        let script = self.scripts.get(&name).cloned().unwrap_or_default();
        self.started.lock().push(name.clone());

        for target in &script.waits_for {
            ctx.wait_for_stage(target).await?;
            if !ctx.is_stage_terminated(target) {
                self.wait_violations
                    .lock()
                    .push(format!("{name} -> {target}"));
            }
        }

        let _active = ActiveGuard::enter(&self.active, &self.max_active);
        for container in &script.containers {
            handle.record_container(container.clone());
            if let Some(store) = &self.store {
                store.insert_container(container.clone());
            }
        }
        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }
        if script.panics {
            panic!("stage {name} blew up");
        }
        if let Some(message) = &script.failure {
            return Err(BuildError::stage_failed(name, message.clone()));
        }

        let image_id = Self::image_id_for(handle, &script);
        let mut output = StageOutput::new(image_id.clone());
        if let Some(store) = &self.store {
            if handle.output().is_empty() {
                store.insert_image(image_id.clone(), &[]);
            } else {
                let canonical = format!("localhost/{}", handle.output());
                store.insert_image(image_id.clone(), &[canonical.as_str()]);
                output = output.with_reference(CanonicalReference::new(
                    canonical,
                    format!("sha256:{image_id}"),
                ));
            }
        }
        self.finished.lock().push(name);
        Ok(output)
    }

    async fn delete(&self, stage: &StageHandle) -> Result<(), BuildError> {
        self.deleted.lock().push(stage.name().to_string());
        if self.fail_delete {
            return Err(BuildError::Internal(format!(
                "removing working container of stage {}",
                stage.name()
            )));
        }
        Ok(())
    }
}

/// A cloneable in-memory writer for capturing build output.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns everything written so far.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
