//! Artifact publishing boundary

use crate::core::Visibility;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("artifact not found: {0}")]
    MissingSource(PathBuf),

    #[error("invalid remote location '{0}'")]
    InvalidRemote(String),

    #[error("upload of {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Uploads build artifacts
#[async_trait]
pub trait ArtifactPublisher: Send + Sync {
    async fn upload(
        &self,
        local: &Path,
        remote: &str,
        visibility: Visibility,
    ) -> Result<(), PublishError>;
}

#[async_trait]
impl<T: ArtifactPublisher + ?Sized> ArtifactPublisher for Box<T> {
    async fn upload(
        &self,
        local: &Path,
        remote: &str,
        visibility: Visibility,
    ) -> Result<(), PublishError> {
        (**self).upload(local, remote, visibility).await
    }
}

/// Marker file written next to public artifacts
pub const PUBLIC_MARKER_SUFFIX: &str = ".public";

/// Publishes artifacts by copying them under a root directory
#[derive(Debug, Clone)]
pub struct DirectoryPublisher {
    root: PathBuf,
}

impl DirectoryPublisher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a remote location inside the root, rejecting escapes
    fn destination(&self, remote: &str) -> Result<PathBuf, PublishError> {
        let relative = Path::new(remote);
        let clean = !remote.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !clean {
            return Err(PublishError::InvalidRemote(remote.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArtifactPublisher for DirectoryPublisher {
    async fn upload(
        &self,
        local: &Path,
        remote: &str,
        visibility: Visibility,
    ) -> Result<(), PublishError> {
        let destination = self.destination(remote)?;

        if !tokio::fs::try_exists(local).await.unwrap_or(false) {
            return Err(PublishError::MissingSource(local.to_path_buf()));
        }

        let io_err = |source| PublishError::Io {
            path: destination.clone(),
            source,
        };

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::copy(local, &destination).await.map_err(io_err)?;

        let mut marker = destination.clone().into_os_string();
        marker.push(PUBLIC_MARKER_SUFFIX);
        let marker = PathBuf::from(marker);
        match visibility {
            Visibility::Public => {
                tokio::fs::write(&marker, b"").await.map_err(io_err)?;
            }
            Visibility::Private => {
                let _ = tokio::fs::remove_file(&marker).await;
            }
        }

        info!(
            "Published {} to {} ({:?})",
            local.display(),
            destination.display(),
            visibility
        );
        Ok(())
    }
}

/// Logs uploads without performing them
#[derive(Debug, Clone, Default)]
pub struct DryRunPublisher;

#[async_trait]
impl ArtifactPublisher for DryRunPublisher {
    async fn upload(
        &self,
        local: &Path,
        remote: &str,
        visibility: Visibility,
    ) -> Result<(), PublishError> {
        info!(
            "[dry-run] would publish {} to {} ({:?})",
            local.display(),
            remote,
            visibility
        );
        Ok(())
    }
}
