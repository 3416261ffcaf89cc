//! Post-build cleanup of stage containers and intermediate images.

use super::state::BuildState;
use crate::errors::BuildError;
use serde::Serialize;
use tracing::{debug, error};

/// What one cleanup pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Stages whose containers were discarded through the executor.
    pub stages: usize,
    /// Containers deleted from storage.
    pub containers: usize,
    /// Intermediate images deleted from storage.
    pub images: usize,
}

/// Runs every cleanup step once, attempting each deletion.
///
/// Returns the report and the last error seen, if any.
pub(crate) async fn run_cleanup(state: &BuildState) -> (CleanupReport, Option<BuildError>) {
    let mut report = CleanupReport::default();
    let mut last_error = None;

    let (stages, rootfs_containers, images, final_image) = {
        let mut book = state.book();
        (
            std::mem::take(&mut book.cleanup_stages),
            std::mem::take(&mut book.rootfs_containers),
            std::mem::take(&mut book.cleanup_images),
            book.final_output.as_ref().map(|output| output.image_id.clone()),
        )
    };

    for stage in stages.values() {
        match state.executor.delete(stage).await {
            Ok(()) => report.stages += 1,
            Err(err) => {
                debug!(stage = %stage.name(), error = %err, "failed to clean up stage containers");
                last_error = Some(err);
            }
        }
    }

    for (image, container) in &rootfs_containers {
        match state.store.delete_container(container).await {
            Ok(()) => report.containers += 1,
            Err(err) => {
                debug!(
                    image = %image,
                    container = %container,
                    error = %err,
                    "failed to clean up image container"
                );
                last_error = Some(err.into());
            }
        }
    }

    if state.options.container_retention.removes_on_success() {
        let handles: Vec<_> = state.book().handles.values().cloned().collect();
        for handle in handles {
            for container in handle.take_container_ids() {
                match state.store.delete_container(&container).await {
                    Ok(()) => report.containers += 1,
                    Err(err) => {
                        error!(
                            container = %container,
                            error = %err,
                            "error deleting build container"
                        );
                        last_error = Some(err.into());
                    }
                }
            }
        }
    }

    let forced = state.options.container_retention.is_forced();
    for image in images.iter().rev() {
        if final_image.as_deref() == Some(image.as_str()) {
            continue;
        }
        match state.store.delete_image(image, true).await {
            Ok(()) => report.images += 1,
            Err(err) => {
                debug!(image = %image, error = %err, "failed to remove intermediate image");
                if forced || !err.is_image_in_use() {
                    last_error = Some(err.into());
                }
            }
        }
    }

    (report, last_error)
}
