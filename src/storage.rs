//! Blob storage collaborator.
//!
//! The surrounding product stores uploaded files in a hosted object store;
//! the core only needs "fetch bytes by storage key". [`FsStorage`] is the
//! concrete implementation used by the CLI and server, reading from a
//! configured upload root.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use crate::error::PipelineError;

#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Fetch the raw bytes for a storage key, or `NotFound`.
    async fn fetch(&self, key: &str) -> Result<Vec<u8>, PipelineError>;
}

/// Filesystem-backed storage rooted at a single directory.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, PipelineError> {
        let rel = Path::new(key);
        // Keys must stay inside the upload root.
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(PipelineError::InvalidInput(format!(
                "invalid storage key: {key}"
            )));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl BlobStorage for FsStorage {
    async fn fetch(&self, key: &str) -> Result<Vec<u8>, PipelineError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PipelineError::NotFound(
                format!("storage key not found: {key}"),
            )),
            Err(e) => Err(PipelineError::Fatal(format!(
                "storage read failed for {key}: {e}"
            ))),
        }
    }
}
