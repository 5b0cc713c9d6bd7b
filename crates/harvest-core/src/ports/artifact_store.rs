//! ArtifactStore port - blob storage for produced artifacts.
//!
//! Paths returned by `store` start with `<scheme>://` and are what data object
//! records point at. Errors carry the offending path.

use async_trait::async_trait;

use crate::domain::{HarvestResult, Metadata};

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Scheme prefix of every path this store hands out (`mem`, `file`).
    fn scheme(&self) -> &str;

    async fn store(
        &self,
        bytes: &[u8],
        content_type: &str,
        metadata: &Metadata,
    ) -> HarvestResult<String>;

    async fn retrieve(&self, path: &str) -> HarvestResult<Vec<u8>>;

    /// Returns false if nothing was stored at `path`.
    async fn delete(&self, path: &str) -> HarvestResult<bool>;
}
