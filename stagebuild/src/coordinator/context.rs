//! The view of the build a stage executor works through.

use super::state::BuildState;
use crate::cancellation::CancellationToken;
use crate::errors::BuildError;
use crate::options::BuildOptions;
use crate::stage::StageHandle;
use crate::storage::{resolve_output_reference, HistoryEntry, ImageReference};
use std::sync::Arc;
use tracing::debug;

/// A running stage together with the build it belongs to.
///
/// Executors receive one of these per stage. It is the only way a stage
/// reaches other stages: waiting for them, reading their images, and
/// registering containers for cleanup.
#[derive(Clone)]
pub struct StageContext {
    handle: Arc<StageHandle>,
    state: Arc<BuildState>,
}

impl StageContext {
    pub(crate) fn new(handle: Arc<StageHandle>, state: Arc<BuildState>) -> Self {
        Self { handle, state }
    }

    /// Returns the running stage's handle.
    #[must_use]
    pub fn handle(&self) -> &Arc<StageHandle> {
        &self.handle
    }

    /// Returns the build options.
    #[must_use]
    pub fn options(&self) -> &BuildOptions {
        &self.state.options
    }

    /// Returns the build-scoped cancellation token.
    ///
    /// It fires on the first stage failure and on external cancellation.
    #[must_use]
    pub fn cancel_token(&self) -> &Arc<CancellationToken> {
        &self.state.cancel
    }

    /// Waits until the stage called `name` has terminated.
    ///
    /// `name` is a stage alias or stringified position. The running stage
    /// gives up its admission permit while it waits and holds one again when
    /// this returns `Ok`. Fails with the build's first error as soon as any
    /// stage fails.
    pub async fn wait_for_stage(&self, name: &str) -> Result<(), BuildError> {
        self.state.wait_for_stage(&self.handle, name).await
    }

    /// Returns the image produced by an earlier, successful non-terminal stage.
    #[must_use]
    pub fn stage_image(&self, name: &str) -> Option<String> {
        let index = self.state.resolve(name)?;
        self.state.book().images.get(&index).cloned()
    }

    /// Returns the handle of a started stage, by alias or position.
    #[must_use]
    pub fn lookup_stage(&self, name: &str) -> Option<Arc<StageHandle>> {
        self.state.lookup(name)
    }

    /// Returns true once the stage called `name` has terminated.
    #[must_use]
    pub fn is_stage_terminated(&self, name: &str) -> bool {
        self.state.is_terminated(name)
    }

    /// Returns true if some stage's `FROM` names `name` literally.
    #[must_use]
    pub fn is_base_image(&self, name: &str) -> bool {
        self.state.references.is_base_image(name)
    }

    /// Returns true if some stage copies files out of `name`.
    #[must_use]
    pub fn is_rootfs_referenced(&self, name: &str) -> bool {
        self.state.references.is_rootfs_referenced(name)
    }

    /// Records a container created only to read `image`'s root filesystem.
    ///
    /// Such containers are deleted during cleanup whatever the build outcome.
    pub fn register_rootfs_container(
        &self,
        image: impl Into<String>,
        container_id: impl Into<String>,
    ) {
        let image = image.into();
        let container_id = container_id.into();
        debug!(image = %image, container = %container_id, "registered rootfs container");
        self.state
            .book()
            .rootfs_containers
            .insert(image, container_id);
    }

    /// Returns the container registered for `image`'s root filesystem.
    #[must_use]
    pub fn rootfs_container(&self, image: &str) -> Option<String> {
        self.state.book().rootfs_containers.get(image).cloned()
    }

    /// Returns the history of an image.
    pub async fn image_history(&self, image_id: &str) -> Result<Vec<HistoryEntry>, BuildError> {
        self.state
            .store
            .image_history(image_id)
            .await
            .map_err(|err| {
                BuildError::from(err)
                    .context(format!("error getting history of image {image_id:?}"))
            })
    }

    /// Resolves an image name to a storage reference.
    pub async fn resolve_output_reference(&self, name: &str) -> Result<ImageReference, BuildError> {
        resolve_output_reference(self.state.store.as_ref(), name).await
    }
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("stage", &self.handle.name())
            .field("index", &self.handle.index())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoOpEventSink;
    use crate::stage::{StageDescriptor, StageOutput};
    use crate::storage::Transport;
    use crate::testing::{fixtures, MemoryImageStore, ScriptedExecutor};
    use pretty_assertions::assert_eq;

    fn context(store: Arc<MemoryImageStore>) -> StageContext {
        context_with_options(store, BuildOptions::new())
    }

    fn context_with_options(store: Arc<MemoryImageStore>, options: BuildOptions) -> StageContext {
        let stages: Vec<StageDescriptor> = vec![
            fixtures::named_stage(0, "builder", "golang"),
            fixtures::stage_copying_from(1, "scratch", "builder"),
        ];
        let state = Arc::new(BuildState::new(
            &stages,
            1,
            Arc::new(CancellationToken::new()),
            Arc::new(options),
            store,
            Arc::new(ScriptedExecutor::new()),
            Arc::new(NoOpEventSink),
        ));
        let descriptor = state.stages[1].clone();
        let handle = state.start_stage(&descriptor, 2, "app");
        StageContext::new(handle, state)
    }

    #[test]
    fn test_executor_facing_options_pass_through() {
        let mut options = BuildOptions::new();
        options.no_cache = true;
        options.squash = true;
        let ctx = context_with_options(Arc::new(MemoryImageStore::new()), options);
        assert!(ctx.options().no_cache);
        assert!(ctx.options().squash);
    }

    #[test]
    fn test_cross_reference_queries() {
        let ctx = context(Arc::new(MemoryImageStore::new()));
        assert!(ctx.is_base_image("golang"));
        assert!(!ctx.is_base_image("scratch"));
        assert!(ctx.is_rootfs_referenced("builder"));
        assert!(!ctx.is_rootfs_referenced("1"));
    }

    #[test]
    fn test_stage_image_by_alias_and_position() {
        let ctx = context(Arc::new(MemoryImageStore::new()));
        assert!(ctx.stage_image("builder").is_none());

        ctx.state.complete_stage(0, &Ok(StageOutput::new("img-builder")));
        assert_eq!(ctx.stage_image("builder").as_deref(), Some("img-builder"));
        assert_eq!(ctx.stage_image("0").as_deref(), Some("img-builder"));
        assert!(ctx.is_stage_terminated("builder"));
    }

    #[test]
    fn test_rootfs_container_registry() {
        let ctx = context(Arc::new(MemoryImageStore::new()));
        ctx.register_rootfs_container("golang", "ctr-1");
        assert_eq!(ctx.rootfs_container("golang").as_deref(), Some("ctr-1"));
        assert!(ctx.rootfs_container("alpine").is_none());
    }

    #[test]
    fn test_lookup_stage_returns_own_handle() {
        let ctx = context(Arc::new(MemoryImageStore::new()));
        let found = ctx.lookup_stage("1").unwrap();
        assert!(Arc::ptr_eq(&found, ctx.handle()));
        assert!(ctx.lookup_stage("builder").is_none());
    }

    #[tokio::test]
    async fn test_image_history() {
        let store = Arc::new(MemoryImageStore::new());
        store.insert_image("img-1", &["localhost/app:latest"]);
        store.set_history("img-1", vec![HistoryEntry::created_by("RUN make")]);
        let ctx = context(store);

        let history = ctx.image_history("img-1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].created_by.as_deref(), Some("RUN make"));

        let err = ctx.image_history("missing").await.unwrap_err();
        assert!(err.to_string().starts_with("error getting history of image \"missing\""));
    }

    #[tokio::test]
    async fn test_resolve_output_reference() {
        let ctx = context(Arc::new(MemoryImageStore::new()));
        let reference = ctx.resolve_output_reference("app:latest").await.unwrap();
        assert_eq!(reference.transport(), Transport::Local);
        assert_eq!(reference.name(), "localhost/app:latest");
    }
}
