//! InMemoryArtifactStore - blobs in a map, paths under `mem://artifacts/`.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::data_object::validate_storage_path;
use crate::domain::{HarvestError, HarvestResult, Metadata};
use crate::ports::ArtifactStore;

const SCHEME: &str = "mem";

#[derive(Debug, Clone)]
struct StoredBlob {
    bytes: Vec<u8>,
    content_type: String,
}

#[derive(Default)]
pub struct InMemoryArtifactStore {
    blobs: Mutex<HashMap<String, StoredBlob>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.lock().await.is_empty()
    }

    pub async fn content_type(&self, path: &str) -> Option<String> {
        self.blobs
            .lock()
            .await
            .get(path)
            .map(|b| b.content_type.clone())
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    fn scheme(&self) -> &str {
        SCHEME
    }

    async fn store(
        &self,
        bytes: &[u8],
        content_type: &str,
        _metadata: &Metadata,
    ) -> HarvestResult<String> {
        let path = format!("{SCHEME}://artifacts/{}", Uuid::new_v4());
        self.blobs.lock().await.insert(
            path.clone(),
            StoredBlob {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(path)
    }

    async fn retrieve(&self, path: &str) -> HarvestResult<Vec<u8>> {
        validate_storage_path(path, SCHEME)?;
        self.blobs
            .lock()
            .await
            .get(path)
            .map(|b| b.bytes.clone())
            .ok_or_else(|| HarvestError::storage(path, "no such object", false))
    }

    async fn delete(&self, path: &str) -> HarvestResult<bool> {
        validate_storage_path(path, SCHEME)?;
        Ok(self.blobs.lock().await.remove(path).is_some())
    }
}
