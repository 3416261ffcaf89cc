//! The image/container store seam.

use super::ImageReference;
use crate::errors::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// One entry of an image's OCI history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the layer was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    /// The command that created the layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// Author of the layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Free-form comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// True if the entry did not produce a filesystem layer.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

impl HistoryEntry {
    /// Creates an entry for a command.
    #[must_use]
    pub fn created_by(command: impl Into<String>) -> Self {
        Self {
            created_by: Some(command.into()),
            ..Default::default()
        }
    }

    /// Sets the creation time.
    #[must_use]
    pub fn at(mut self, created: DateTime<Utc>) -> Self {
        self.created = Some(created);
        self
    }

    /// Marks the entry as not producing a layer.
    #[must_use]
    pub fn empty_layer(mut self) -> Self {
        self.empty_layer = true;
        self
    }
}

/// An image as recorded in local storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredImage {
    /// Image ID.
    pub id: String,
    /// Names attached to the image.
    pub names: Vec<String>,
}

/// Local image and container storage.
#[async_trait]
pub trait ImageStore: Send + Sync + Debug {
    /// Deletes an image. With `commit` unset the deletion is only simulated.
    async fn delete_image(&self, image_id: &str, commit: bool) -> Result<(), StorageError>;

    /// Deletes a container.
    async fn delete_container(&self, container_id: &str) -> Result<(), StorageError>;

    /// Expands a short name into fully qualified local candidates, best first.
    async fn resolve_name(&self, name: &str) -> Result<Vec<String>, StorageError>;

    /// Looks up the image a local reference points at.
    async fn lookup_image(&self, reference: &ImageReference) -> Result<StoredImage, StorageError>;

    /// Attaches additional names to an image.
    async fn add_names(&self, image_id: &str, names: &[String]) -> Result<(), StorageError>;

    /// Returns the (possibly converted) OCI history of an image.
    async fn image_history(&self, image_id: &str) -> Result<Vec<HistoryEntry>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_history_entry_json() {
        let entry = HistoryEntry::created_by("/bin/sh -c apk add curl").empty_layer();
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "created_by": "/bin/sh -c apk add curl",
                "empty_layer": true
            })
        );
    }

    #[test]
    fn test_history_entry_parses_oci_config() {
        let entry: HistoryEntry = serde_json::from_str(
            r#"{"created": "2024-01-02T03:04:05Z", "created_by": "COPY . /src", "comment": "buildkit"}"#,
        )
        .unwrap();

        assert!(entry.created.is_some());
        assert_eq!(entry.comment.as_deref(), Some("buildkit"));
        assert!(!entry.empty_layer);
    }
}
