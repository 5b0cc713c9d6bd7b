//! LocalArtifactStore - blobs as files under a root directory.
//!
//! A stored object gets the key `<yyyy-mm-dd>/<uuid>` and the path
//! `file://<key>`; the file lives at `<root>/<key>`.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::domain::data_object::validate_storage_path;
use crate::domain::{HarvestError, HarvestResult, Metadata};
use crate::ports::ArtifactStore;

const SCHEME: &str = "file";

pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub async fn open(root: impl Into<PathBuf>) -> HarvestResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| storage_error(&root.display().to_string(), e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> HarvestResult<PathBuf> {
        validate_storage_path(path, SCHEME)?;
        let key = &path[SCHEME.len() + 3..];
        Ok(self.root.join(key))
    }
}

/// Interruptions and timeouts are worth retrying; everything else is not.
fn storage_error(path: &str, err: std::io::Error) -> HarvestError {
    let transient = matches!(
        err.kind(),
        IoErrorKind::TimedOut | IoErrorKind::Interrupted | IoErrorKind::WouldBlock
    );
    HarvestError::storage(path, err.to_string(), transient)
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    fn scheme(&self) -> &str {
        SCHEME
    }

    async fn store(
        &self,
        bytes: &[u8],
        _content_type: &str,
        _metadata: &Metadata,
    ) -> HarvestResult<String> {
        let path = format!(
            "{SCHEME}://{}/{}",
            Utc::now().format("%Y-%m-%d"),
            Uuid::new_v4()
        );
        let file_path = self.resolve(&path)?;
        if let Some(dir) = file_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| storage_error(&path, e))?;
        }

        let mut file = tokio::fs::File::create_new(&file_path)
            .await
            .map_err(|e| storage_error(&path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| storage_error(&path, e))?;
        file.sync_all().await.map_err(|e| storage_error(&path, e))?;
        Ok(path)
    }

    async fn retrieve(&self, path: &str) -> HarvestResult<Vec<u8>> {
        let file_path = self.resolve(path)?;
        tokio::fs::read(&file_path)
            .await
            .map_err(|e| storage_error(path, e))
    }

    async fn delete(&self, path: &str) -> HarvestResult<bool> {
        let file_path = self.resolve(path)?;
        match tokio::fs::remove_file(&file_path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
            Err(e) => Err(storage_error(path, e)),
        }
    }
}
