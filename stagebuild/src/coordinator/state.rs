//! Shared bookkeeping for one build.

use super::admission::{cancellation_error, AdmissionGate};
use super::scan::CrossReferences;
use crate::cancellation::CancellationToken;
use crate::errors::BuildError;
use crate::events::EventSink;
use crate::options::BuildOptions;
use crate::stage::{StageDescriptor, StageExecutor, StageHandle, StageOutput};
use crate::storage::ImageStore;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Everything guarded by the build's single bookkeeping lock.
#[derive(Default)]
pub(crate) struct Bookkeeping {
    /// Started stages, by position.
    pub(crate) handles: BTreeMap<usize, Arc<StageHandle>>,
    pub(crate) terminated: HashSet<usize>,
    pub(crate) first_error: Option<BuildError>,
    /// Images produced by non-terminal stages, by position.
    pub(crate) images: HashMap<usize, String>,
    /// Stages whose containers are deleted during cleanup.
    pub(crate) cleanup_stages: BTreeMap<usize, Arc<StageHandle>>,
    /// Intermediate images to remove, in completion order.
    pub(crate) cleanup_images: Vec<String>,
    /// Containers created only to expose an image's root filesystem.
    pub(crate) rootfs_containers: BTreeMap<String, String>,
    pub(crate) final_output: Option<StageOutput>,
}

/// The state shared by the dispatcher, stage tasks and the aggregator.
pub(crate) struct BuildState {
    pub(crate) stages: Vec<Arc<StageDescriptor>>,
    aliases: HashMap<String, usize>,
    signals: Vec<watch::Sender<bool>>,
    pub(crate) gate: AdmissionGate,
    pub(crate) cancel: Arc<CancellationToken>,
    pub(crate) options: Arc<BuildOptions>,
    pub(crate) references: CrossReferences,
    pub(crate) store: Arc<dyn ImageStore>,
    pub(crate) executor: Arc<dyn StageExecutor>,
    pub(crate) events: Arc<dyn EventSink>,
    book: Mutex<Bookkeeping>,
}

impl BuildState {
    pub(crate) fn new(
        stages: &[StageDescriptor],
        permits: usize,
        cancel: Arc<CancellationToken>,
        options: Arc<BuildOptions>,
        store: Arc<dyn ImageStore>,
        executor: Arc<dyn StageExecutor>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let references = CrossReferences::scan(stages);
        let stages: Vec<_> = stages.iter().cloned().map(Arc::new).collect();
        Self {
            aliases: alias_index(&stages),
            signals: stages.iter().map(|_| watch::channel(false).0).collect(),
            stages,
            gate: AdmissionGate::new(permits),
            cancel,
            options,
            references,
            store,
            executor,
            events,
            book: Mutex::new(Bookkeeping::default()),
        }
    }

    pub(crate) fn book(&self) -> parking_lot::MutexGuard<'_, Bookkeeping> {
        self.book.lock()
    }

    pub(crate) fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Resolves a stage name or stringified position to a position.
    pub(crate) fn resolve(&self, name: &str) -> Option<usize> {
        self.aliases.get(name).copied()
    }

    /// Creates and registers the handle for a stage being admitted.
    pub(crate) fn start_stage(
        &self,
        descriptor: &Arc<StageDescriptor>,
        total_stages: usize,
        output: &str,
    ) -> Arc<StageHandle> {
        let handle = Arc::new(StageHandle::new(descriptor.clone(), total_stages, output));
        let previous = self
            .book()
            .handles
            .insert(descriptor.position(), handle.clone());
        debug_assert!(previous.is_none(), "stage started twice");
        debug!(stage = %descriptor.name(), index = descriptor.position(), "started stage");
        handle
    }

    /// Returns the handle registered under a name or position.
    pub(crate) fn lookup(&self, name: &str) -> Option<Arc<StageHandle>> {
        let index = self.resolve(name)?;
        self.book().handles.get(&index).cloned()
    }

    pub(crate) fn is_terminated(&self, name: &str) -> bool {
        self.resolve(name)
            .is_some_and(|index| self.book().terminated.contains(&index))
    }

    pub(crate) fn first_error(&self) -> Option<BuildError> {
        self.book().first_error.clone()
    }

    /// Stores `err` as the build's error unless one is already set.
    pub(crate) fn record_failure(&self, err: BuildError) -> bool {
        let mut book = self.book();
        if book.first_error.is_some() {
            return false;
        }
        book.first_error = Some(err);
        true
    }

    pub(crate) fn register_stage_cleanup(&self, handle: &Arc<StageHandle>) {
        self.book()
            .cleanup_stages
            .insert(handle.index(), handle.clone());
    }

    /// Records a stage's termination and wakes anything waiting on it.
    ///
    /// Returns true when `outcome` is the first failure of the build.
    pub(crate) fn complete_stage(
        &self,
        index: usize,
        outcome: &Result<StageOutput, BuildError>,
    ) -> bool {
        let terminal = index + 1 == self.stage_count();
        let first_failure = {
            let mut book = self.book();
            let newly_terminated = book.terminated.insert(index);
            debug_assert!(newly_terminated, "stage terminated twice");
            let failed_before = book.first_error.is_some();

            match outcome {
                Err(err) => {
                    if !failed_before {
                        book.first_error = Some(err.clone());
                    }
                    !failed_before
                }
                Ok(output) if terminal => {
                    if !failed_before {
                        book.final_output = Some(output.clone());
                    }
                    false
                }
                Ok(output) => {
                    if !output.image_id.is_empty() {
                        if !failed_before {
                            book.images.insert(index, output.image_id.clone());
                        }
                        if !self.options.layers {
                            book.cleanup_images.push(output.image_id.clone());
                        }
                    }
                    false
                }
            }
        };
        if let Some(signal) = self.signals.get(index) {
            signal.send_replace(true);
        }
        first_failure
    }

    /// Blocks `waiter` until the stage called `name` has terminated.
    ///
    /// While blocked the waiter gives its admission permit back, so the
    /// stage it waits on can be admitted even with a single permit.
    pub(crate) async fn wait_for_stage(
        &self,
        waiter: &StageHandle,
        name: &str,
    ) -> Result<(), BuildError> {
        let index = self
            .resolve(name)
            .ok_or_else(|| BuildError::unknown_stage(name))?;
        if index == waiter.index() {
            return Err(BuildError::stage_failed(
                waiter.name(),
                format!("stage cannot wait for itself ({name:?})"),
            ));
        }

        let mut signal = self.signals[index].subscribe();
        loop {
            {
                let book = self.book();
                if let Some(err) = &book.first_error {
                    return Err(err.clone());
                }
                if book.terminated.contains(&index) {
                    return Ok(());
                }
            }

            let released = waiter.release_admission();
            debug!(stage = %waiter.name(), target = %name, released, "waiting for stage");

            let woken = tokio::select! {
                changed = signal.changed() => changed.map_err(|_| {
                    BuildError::Internal(format!("completion signal for stage {name:?} closed"))
                }),
                () = self.cancel.cancelled() => Err(self.abort_error()),
            };
            let reacquired = match woken {
                Ok(()) if released => self
                    .gate
                    .acquire(&self.cancel)
                    .await
                    .map(Some)
                    .map_err(|_| self.abort_error()),
                Ok(()) => Ok(None),
                Err(err) => Err(err),
            };
            if let Some(permit) = reacquired? {
                waiter.hold_admission(permit);
            }
        }
    }

    /// The error to report when a wait or admission is interrupted.
    pub(crate) fn abort_error(&self) -> BuildError {
        self.first_error()
            .unwrap_or_else(|| cancellation_error(&self.cancel))
    }
}

fn alias_index(stages: &[Arc<StageDescriptor>]) -> HashMap<String, usize> {
    let mut aliases = HashMap::with_capacity(stages.len() * 2);
    for stage in stages {
        aliases.insert(stage.name().to_string(), stage.position());
    }
    // Positions win over a name that happens to look like a number.
    for stage in stages {
        aliases.insert(stage.position_key(), stage.position());
    }
    aliases
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoOpEventSink;
    use crate::testing::{fixtures, MemoryImageStore, ScriptedExecutor};
    use std::time::Duration;

    fn state(stages: &[StageDescriptor], permits: usize, options: BuildOptions) -> Arc<BuildState> {
        Arc::new(BuildState::new(
            stages,
            permits,
            Arc::new(CancellationToken::new()),
            Arc::new(options),
            Arc::new(MemoryImageStore::new()),
            Arc::new(ScriptedExecutor::new()),
            Arc::new(NoOpEventSink),
        ))
    }

    fn three_stages() -> Vec<StageDescriptor> {
        vec![
            fixtures::named_stage(0, "builder", "alpine"),
            fixtures::stage(1, "builder"),
            fixtures::stage(2, "1"),
        ]
    }

    #[test]
    fn test_alias_resolution() {
        let state = state(&three_stages(), 1, BuildOptions::new());
        assert_eq!(state.resolve("builder"), Some(0));
        assert_eq!(state.resolve("0"), Some(0));
        assert_eq!(state.resolve("2"), Some(2));
        assert_eq!(state.resolve("missing"), None);
        assert!(state.aliases.len() <= 2 * state.stage_count());
    }

    #[test]
    fn test_position_beats_numeric_name() {
        let stages = vec![
            fixtures::named_stage(0, "1", "alpine"),
            fixtures::stage(1, "alpine"),
        ];
        let state = state(&stages, 1, BuildOptions::new());
        assert_eq!(state.resolve("1"), Some(1));
        assert_eq!(state.resolve("0"), Some(0));
    }

    #[test]
    fn test_lookup_by_name_and_position_share_handle() {
        let state = state(&three_stages(), 1, BuildOptions::new());
        assert!(state.lookup("builder").is_none());

        let handle = state.start_stage(&state.stages[0].clone(), 3, "");
        let by_name = state.lookup("builder").unwrap();
        let by_position = state.lookup("0").unwrap();
        assert!(Arc::ptr_eq(&handle, &by_name));
        assert!(Arc::ptr_eq(&by_name, &by_position));
    }

    #[test]
    fn test_complete_stage_bookkeeping() {
        let state = state(&three_stages(), 1, BuildOptions::new());

        assert!(!state.complete_stage(0, &Ok(StageOutput::new("img-0"))));
        assert!(state.is_terminated("builder"));
        assert!(state.complete_stage(1, &Err(BuildError::stage_failed("1", "boom"))));
        assert!(!state.complete_stage(2, &Err(BuildError::stage_failed("2", "later"))));

        let book = state.book();
        assert_eq!(book.images.get(&0).map(String::as_str), Some("img-0"));
        assert_eq!(book.cleanup_images, vec!["img-0"]);
        assert!(matches!(
            &book.first_error,
            Some(BuildError::StageExecution { stage, .. }) if stage == "1"
        ));
        assert!(book.final_output.is_none());
    }

    #[test]
    fn test_layers_keep_intermediate_images() {
        let state = state(&three_stages(), 1, BuildOptions::new().with_layers(true));
        state.complete_stage(0, &Ok(StageOutput::new("img-0")));
        state.complete_stage(2, &Ok(StageOutput::new("img-2")));

        let book = state.book();
        assert!(book.cleanup_images.is_empty());
        assert_eq!(book.final_output.as_ref().map(|o| o.image_id.as_str()), Some("img-2"));
    }

    #[tokio::test]
    async fn test_wait_for_unknown_stage() {
        let state = state(&three_stages(), 1, BuildOptions::new());
        let waiter = state.start_stage(&state.stages[1].clone(), 3, "");
        let err = state.wait_for_stage(&waiter, "nope").await.unwrap_err();
        assert!(matches!(err, BuildError::UnknownStage { name } if name == "nope"));
    }

    #[tokio::test]
    async fn test_wait_releases_and_reacquires_permit() {
        let state = state(&three_stages(), 1, BuildOptions::new());
        let waiter = state.start_stage(&state.stages[1].clone(), 3, "");
        waiter.hold_admission(state.gate.acquire(&state.cancel).await.unwrap());

        let wait = {
            let state = state.clone();
            let waiter = waiter.clone();
            tokio::spawn(async move { state.wait_for_stage(&waiter, "builder").await })
        };

        // The waiter gave its permit back, so the target can be admitted.
        let target_permit = tokio::time::timeout(
            Duration::from_secs(1),
            state.gate.acquire(&state.cancel),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!wait.is_finished());

        drop(target_permit);
        state.complete_stage(0, &Ok(StageOutput::new("img-0")));

        tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(waiter.holds_admission());
        assert_eq!(state.gate.available(), 0);
    }

    #[tokio::test]
    async fn test_wait_returns_once_target_terminated() {
        let state = state(&three_stages(), 2, BuildOptions::new());
        let waiter = state.start_stage(&state.stages[2].clone(), 3, "");
        state.book().terminated.insert(1);

        state.wait_for_stage(&waiter, "1").await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_aborts_with_first_error() {
        let state = state(&three_stages(), 2, BuildOptions::new());
        let waiter = state.start_stage(&state.stages[2].clone(), 3, "");

        let wait = {
            let state = state.clone();
            let waiter = waiter.clone();
            tokio::spawn(async move { state.wait_for_stage(&waiter, "1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        state.complete_stage(0, &Err(BuildError::stage_failed("builder", "exit status 1")));
        state.cancel.cancel("stage builder failed");

        let err = tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BuildError::StageExecution { stage, .. } if stage == "builder"));
    }

    #[tokio::test]
    async fn test_wait_cancelled_externally() {
        let state = state(&three_stages(), 1, BuildOptions::new());
        let waiter = state.start_stage(&state.stages[1].clone(), 3, "");
        state.cancel.cancel("interrupted");

        let err = state.wait_for_stage(&waiter, "0").await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_for_self_rejected() {
        let state = state(&three_stages(), 1, BuildOptions::new());
        let waiter = state.start_stage(&state.stages[0].clone(), 3, "");
        assert!(state.wait_for_stage(&waiter, "builder").await.is_err());
    }
}
