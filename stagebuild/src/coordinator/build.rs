//! The build coordinator: dispatch, aggregation, commit and cleanup.

use super::cleanup::run_cleanup;
use super::context::StageContext;
use super::scan::unused_build_args;
use super::state::BuildState;
use crate::cancellation::{CancellationToken, CleanupGuard};
use crate::errors::BuildError;
use crate::events::{
    EventSink, NoOpEventSink, BUILD_CLEANUP, BUILD_COMPLETED, BUILD_FAILED, BUILD_STARTED,
    BUILD_WARNING, STAGE_COMPLETED, STAGE_FAILED, STAGE_STARTED,
};
use crate::options::BuildOptions;
use crate::stage::{
    BuildDefinition, CanonicalReference, StageDescriptor, StageExecutor, StageOutput,
};
use crate::storage::{resolve_output_reference, ImageStore, Transport};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// The image a successful build produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutput {
    /// ID of the last stage's image.
    pub image_id: String,
    /// Canonical reference of that image, when it was named.
    pub reference: Option<CanonicalReference>,
}

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// One stage's result, sent from its task to the aggregator.
struct StageReport {
    index: usize,
    outcome: Result<StageOutput, BuildError>,
}

/// Runs the stages of a build concurrently and produces the final image.
///
/// At most `jobs` stages hold an admission permit at once; stages are
/// admitted in declaration order and may wait for one another through
/// [`StageContext::wait_for_stage`].
///
/// # Example
///
/// ```rust,ignore
/// let coordinator = BuildCoordinator::new(options, store, executor)
///     .with_event_sink(Arc::new(LoggingEventSink::default()));
/// let output = coordinator.build(&definition).await?;
/// ```
pub struct BuildCoordinator {
    options: Arc<BuildOptions>,
    store: Arc<dyn ImageStore>,
    executor: Arc<dyn StageExecutor>,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
    output: SharedWriter,
}

impl BuildCoordinator {
    /// Creates a coordinator writing to standard output.
    #[must_use]
    pub fn new(
        options: BuildOptions,
        store: Arc<dyn ImageStore>,
        executor: Arc<dyn StageExecutor>,
    ) -> Self {
        Self {
            options: Arc::new(options),
            store,
            executor,
            events: Arc::new(NoOpEventSink),
            cancel: Arc::new(CancellationToken::new()),
            output: Arc::new(Mutex::new(Box::new(std::io::stdout()))),
        }
    }

    /// Sets the primary output, which receives warnings and the image ID.
    #[must_use]
    pub fn with_output<W: Write + Send + 'static>(mut self, writer: W) -> Self {
        self.output = Arc::new(Mutex::new(Box::new(writer)));
        self
    }

    /// Sets the sink receiving lifecycle events.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets a token that cancels builds from outside.
    ///
    /// Each build derives its own child token, so a stage failure in one
    /// build never cancels the caller's token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the build options.
    #[must_use]
    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Builds every stage of `definition`.
    ///
    /// On success the last stage's image ID is written to the ID file, or
    /// to the primary output followed by a newline. Cleanup always runs;
    /// a cleanup error is returned alone after a successful build, or
    /// merged into the build's own error.
    pub async fn build(&self, definition: &BuildDefinition) -> Result<BuildOutput, BuildError> {
        let build_id = Uuid::new_v4();
        let span = info_span!("build", build_id = %build_id, stages = definition.stages().len());
        self.run(build_id, definition).instrument(span).await
    }

    async fn run(
        &self,
        build_id: Uuid,
        definition: &BuildDefinition,
    ) -> Result<BuildOutput, BuildError> {
        definition.validate()?;
        let stages = definition.stages();
        let permits = self.options.effective_jobs(stages.len())?;
        let unused_args = unused_build_args(&self.options.args, definition);
        let started = Instant::now();

        let state = Arc::new(BuildState::new(
            stages,
            permits,
            self.cancel.child(),
            self.options.clone(),
            self.store.clone(),
            self.executor.clone(),
            self.events.clone(),
        ));

        info!(jobs = permits, "starting build");
        self.events
            .emit(
                BUILD_STARTED,
                Some(json!({
                    "build_id": build_id.to_string(),
                    "stages": stages.len(),
                    "jobs": permits,
                })),
            )
            .await;

        let mut outcome = dispatch_and_collect(&state).await;
        if outcome.is_ok() {
            if let Err(err) = self.commit(&unused_args).await {
                outcome = Err(err);
            }
        }

        let (report, cleanup_error) = run_cleanup(&state).await;
        self.events
            .emit(
                BUILD_CLEANUP,
                Some(json!({
                    "report": report,
                    "error": cleanup_error.as_ref().map(ToString::to_string),
                })),
            )
            .await;

        let outcome = match (outcome, cleanup_error) {
            (Ok(_), Some(cleanup)) => Err(cleanup),
            (Err(err), Some(cleanup)) => Err(err.with_cleanup_error(cleanup)),
            (outcome, None) => outcome,
        };
        let outcome = match outcome {
            Ok(output) => {
                let emitted = self.emit_image_id(&output.image_id).await;
                emitted.map(|()| BuildOutput {
                    image_id: output.image_id,
                    reference: output.reference,
                })
            }
            Err(err) => Err(err),
        };

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        match &outcome {
            Ok(output) => {
                info!(image = %output.image_id, duration_ms, "build completed");
                self.events
                    .emit(
                        BUILD_COMPLETED,
                        Some(json!({"image_id": output.image_id, "duration_ms": duration_ms})),
                    )
                    .await;
            }
            Err(err) => {
                error!(error = %err, duration_ms, "build failed");
                self.events
                    .emit(
                        BUILD_FAILED,
                        Some(json!({"error": err.to_string(), "duration_ms": duration_ms})),
                    )
                    .await;
            }
        }
        outcome
    }

    /// Reports unused build arguments and attaches additional tags.
    async fn commit(&self, unused_args: &BTreeSet<String>) -> Result<(), BuildError> {
        if !unused_args.is_empty() {
            let list = unused_args.iter().map(String::as_str).collect::<Vec<_>>().join(" ");
            warn!(args = %list, "build args were not consumed");
            if !self.options.quiet {
                self.write_output(&format!(
                    "[Warning] one or more build args were not consumed: [{list}]\n"
                ))?;
            }
            self.events
                .emit(BUILD_WARNING, Some(json!({"unused_args": unused_args})))
                .await;
        }

        if self.options.additional_tags.is_empty() {
            return Ok(());
        }
        let dest = match resolve_output_reference(self.store.as_ref(), &self.options.output).await {
            Ok(dest) => dest,
            Err(err) => {
                debug!(error = %err, "not tagging output image");
                return Ok(());
            }
        };

        if dest.transport() != Transport::Local {
            let message = format!(
                "don't know how to add tags to images stored in {:?} transport",
                dest.transport().name()
            );
            warn!(destination = %dest, "{message}");
            self.events
                .emit(BUILD_WARNING, Some(json!({"message": message})))
                .await;
            return Ok(());
        }

        let image = self.store.lookup_image(&dest).await.map_err(|err| {
            BuildError::from(err).context(format!(
                "error locating just-written image {:?}",
                dest.to_string()
            ))
        })?;
        let mut names = image.names.clone();
        names.extend(self.options.additional_tags.iter().cloned());
        self.store
            .add_names(&image.id, &self.options.additional_tags)
            .await
            .map_err(|err| {
                BuildError::from(err).context(format!("error setting image names to {names:?}"))
            })?;
        debug!(image = %image.id, names = ?names, "assigned names to image");
        Ok(())
    }

    async fn emit_image_id(&self, image_id: &str) -> Result<(), BuildError> {
        debug!(image = %image_id, "printing final image id");
        if let Some(path) = &self.options.iidfile {
            tokio::fs::write(path, image_id).await.map_err(|err| {
                BuildError::from(err).context(format!(
                    "failed to write image ID to file {:?}",
                    path.display().to_string()
                ))
            })
        } else {
            self.write_output(&format!("{image_id}\n"))
                .map_err(|err| err.context("failed to write image ID to stdout"))
        }
    }

    fn write_output(&self, text: &str) -> Result<(), BuildError> {
        let mut output = self.output.lock();
        output.write_all(text.as_bytes())?;
        output.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for BuildCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildCoordinator")
            .field("options", &self.options)
            .field("executor", &self.executor)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Admits every stage in order and aggregates their reports.
///
/// Returns the last stage's output, or the build's first error. Every
/// spawned stage has reported by the time this returns.
async fn dispatch_and_collect(state: &Arc<BuildState>) -> Result<StageOutput, BuildError> {
    let (tx, mut rx) = mpsc::channel(state.stage_count());
    let dispatcher = tokio::spawn(dispatch(state.clone(), tx));

    // The channel closes once the dispatcher and every stage task dropped their sender.
    while let Some(StageReport { index, outcome }) = rx.recv().await {
        let stage = state.stages[index].name();
        let first_failure = state.complete_stage(index, &outcome);
        match &outcome {
            Ok(output) => {
                info!(stage = %stage, index, image = %output.image_id, "stage completed");
                state
                    .events
                    .emit(
                        STAGE_COMPLETED,
                        Some(json!({"stage": stage, "index": index, "image_id": output.image_id})),
                    )
                    .await;
            }
            Err(err) if first_failure => {
                error!(stage = %stage, index, error = %err, "stage failed");
                state
                    .events
                    .emit(
                        STAGE_FAILED,
                        Some(json!({"stage": stage, "index": index, "error": err.to_string()})),
                    )
                    .await;
                state.cancel.cancel(format!("stage {stage:?} failed"));
            }
            Err(err) => {
                debug!(stage = %stage, index, error = %err, "dropping failure after the first");
            }
        }
    }

    if let Err(err) = dispatcher.await {
        state.record_failure(BuildError::Internal(format!("stage dispatcher failed: {err}")));
    }

    let book = state.book();
    if let Some(err) = &book.first_error {
        return Err(err.clone());
    }
    book.final_output
        .clone()
        .ok_or_else(|| BuildError::Internal("last stage finished without a result".to_string()))
}

async fn dispatch(state: Arc<BuildState>, tx: mpsc::Sender<StageReport>) {
    for descriptor in state.stages.clone() {
        // Acquired before spawning so stages start in declaration order.
        let permit = match state.gate.acquire(&state.cancel).await {
            Ok(permit) => permit,
            Err(err) => {
                debug!(stage = %descriptor.name(), error = %err, "stopped admitting stages");
                state.record_failure(err);
                state.cancel.cancel("stage admission stopped");
                return;
            }
        };

        let state = state.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let index = descriptor.position();
            let name = descriptor.name().to_string();
            let outcome = AssertUnwindSafe(run_stage(state, descriptor, permit))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(BuildError::Internal(format!(
                        "stage {name:?} panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                });
            if tx.send(StageReport { index, outcome }).await.is_err() {
                warn!(stage = %name, "aggregator gone before stage reported");
            }
        });
    }
}

async fn run_stage(
    state: Arc<BuildState>,
    descriptor: Arc<StageDescriptor>,
    permit: OwnedSemaphorePermit,
) -> Result<StageOutput, BuildError> {
    let base = descriptor.base_image()?;
    let total = state.stage_count();
    let output = if descriptor.position() + 1 == total {
        state.options.output.as_str()
    } else {
        ""
    };

    let handle = state.start_stage(&descriptor, total, output);
    handle.hold_admission(permit);
    let _release = {
        let handle = handle.clone();
        CleanupGuard::new(move || {
            handle.release_admission();
        })
    };

    if state.options.removes_containers_unconditionally() {
        state.register_stage_cleanup(&handle);
    }

    info!(stage = %handle.name(), index = handle.index(), base = %base, "starting stage");
    state
        .events
        .emit(
            STAGE_STARTED,
            Some(json!({"stage": handle.name(), "index": handle.index(), "base": base})),
        )
        .await;

    let ctx = StageContext::new(handle.clone(), state.clone());
    let output = state.executor.execute(&ctx, &base).await?;

    if state.options.container_retention.removes_on_success() {
        state.register_stage_cleanup(&handle);
    }
    Ok(output)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
