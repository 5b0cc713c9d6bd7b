//! DocumentStore port - named collections of JSON documents.
//!
//! Every document carries a revision counter. `put` is a conditional write:
//! it only succeeds when the caller saw the latest revision, which is what the
//! repositories build their compare-and-swap updates on. There are no
//! multi-document transactions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::HarvestResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Starts at 1 on insert, +1 on every successful `put`.
    pub revision: u64,
    pub body: serde_json::Value,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> HarvestResult<Option<Document>>;

    /// Create a document. `Conflict` if the id is already taken.
    async fn insert(
        &self,
        collection: &str,
        id: &str,
        body: serde_json::Value,
    ) -> HarvestResult<Document>;

    /// Replace a document if its revision is still `expected_revision`.
    ///
    /// `NotFound` if absent, `Conflict` if somebody wrote in between.
    async fn put(
        &self,
        collection: &str,
        id: &str,
        body: serde_json::Value,
        expected_revision: u64,
    ) -> HarvestResult<Document>;

    /// All documents of a collection, in no particular order.
    async fn list(&self, collection: &str) -> HarvestResult<Vec<Document>>;
}
