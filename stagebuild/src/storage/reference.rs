//! Transport-qualified image references and output-name resolution.

use super::ImageStore;
use crate::errors::BuildError;
use std::fmt;
use tracing::debug;

/// Where an image reference points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Local addressable image storage.
    Local,
    /// A remote registry.
    Docker,
    /// A `docker save` archive.
    DockerArchive,
    /// A running docker daemon.
    DockerDaemon,
    /// An OCI layout directory.
    Oci,
    /// An OCI layout archive.
    OciArchive,
    /// A plain directory.
    Dir,
}

impl Transport {
    const ALL: [Self; 7] = [
        Self::Local,
        Self::Docker,
        Self::DockerArchive,
        Self::DockerDaemon,
        Self::Oci,
        Self::OciArchive,
        Self::Dir,
    ];

    /// Returns the transport's name as used in qualified references.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Local => "containers-storage",
            Self::Docker => "docker",
            Self::DockerArchive => "docker-archive",
            Self::DockerDaemon => "docker-daemon",
            Self::Oci => "oci",
            Self::OciArchive => "oci-archive",
            Self::Dir => "dir",
        }
    }

    /// Looks a transport up by name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|transport| transport.name() == name)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An image name qualified with its transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    transport: Transport,
    name: String,
}

impl ImageReference {
    /// Creates a reference into local storage.
    #[must_use]
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            transport: Transport::Local,
            name: name.into(),
        }
    }

    /// Parses a `transport:name` reference.
    ///
    /// Registry references take the `docker://name` form. Returns `None`
    /// when the prefix is not a known transport or the name is empty.
    #[must_use]
    pub fn parse(qualified: &str) -> Option<Self> {
        let (prefix, rest) = qualified.split_once(':')?;
        let transport = Transport::from_name(prefix)?;
        let name = match transport {
            Transport::Docker => rest.strip_prefix("//")?,
            _ => rest,
        };
        if name.is_empty() {
            return None;
        }
        Some(Self {
            transport,
            name: name.to_string(),
        })
    }

    /// Returns the transport.
    #[must_use]
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Returns the transport-specific name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transport {
            Transport::Docker => write!(f, "{}://{}", self.transport, self.name),
            _ => write!(f, "{}:{}", self.transport, self.name),
        }
    }
}

/// Resolves an output name to a concrete storage reference.
///
/// A transport-qualified name is taken as is; anything else is resolved
/// against local storage and the first candidate wins.
pub async fn resolve_output_reference(
    store: &dyn ImageStore,
    output: &str,
) -> Result<ImageReference, BuildError> {
    if let Some(reference) = ImageReference::parse(output) {
        return Ok(reference);
    }

    let candidates = store
        .resolve_name(output)
        .await
        .map_err(|err| BuildError::ResolveOutput {
            name: output.to_string(),
            reason: Some(err.to_string()),
        })?;

    let Some(candidate) = candidates.into_iter().next() else {
        return Err(BuildError::ResolveOutput {
            name: output.to_string(),
            reason: None,
        });
    };
    debug!(output = %output, candidate = %candidate, "resolved output name in local storage");
    Ok(ImageReference::local(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryImageStore;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_qualified() {
        let reference = ImageReference::parse("docker://quay.io/app:latest").unwrap();
        assert_eq!(reference.transport(), Transport::Docker);
        assert_eq!(reference.name(), "quay.io/app:latest");
        assert_eq!(reference.to_string(), "docker://quay.io/app:latest");

        let archive = ImageReference::parse("oci-archive:/tmp/app.tar").unwrap();
        assert_eq!(archive.transport(), Transport::OciArchive);
        assert_eq!(archive.to_string(), "oci-archive:/tmp/app.tar");
    }

    #[test]
    fn test_parse_rejects_unqualified() {
        assert!(ImageReference::parse("app:latest").is_none());
        assert!(ImageReference::parse("localhost/app").is_none());
        assert!(ImageReference::parse("docker:app").is_none());
        assert!(ImageReference::parse("dir:").is_none());
    }

    #[tokio::test]
    async fn test_resolve_qualified_output() {
        let store = MemoryImageStore::new();
        let reference = resolve_output_reference(&store, "dir:/tmp/out").await.unwrap();
        assert_eq!(reference.transport(), Transport::Dir);
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_local_storage() {
        let store = MemoryImageStore::new();
        let reference = resolve_output_reference(&store, "app:latest").await.unwrap();
        assert_eq!(reference, ImageReference::local("localhost/app:latest"));
    }

    #[tokio::test]
    async fn test_resolve_without_candidates() {
        let store = MemoryImageStore::new();
        assert!(matches!(
            resolve_output_reference(&store, "").await,
            Err(BuildError::ResolveOutput { reason: None, .. })
        ));
    }
}
