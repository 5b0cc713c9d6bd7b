//! InMemoryDocumentStore - development/test document store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{HarvestError, HarvestResult};
use crate::ports::{Document, DocumentStore};

/// Collections of revisioned JSON documents behind one async mutex.
///
/// The lock is held only for the map operation itself, never across an
/// await on anything else.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    collections: Mutex<HashMap<String, HashMap<String, Document>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> HarvestResult<Option<Document>> {
        let collections = self.collections.lock().await;
        Ok(collections.get(collection).and_then(|c| c.get(id)).cloned())
    }

    async fn insert(
        &self,
        collection: &str,
        id: &str,
        body: serde_json::Value,
    ) -> HarvestResult<Document> {
        let mut collections = self.collections.lock().await;
        let docs = collections.entry(collection.to_string()).or_default();
        if docs.contains_key(id) {
            return Err(HarvestError::conflict(
                "document",
                format!("{collection}/{id}"),
                "already exists",
            ));
        }
        let doc = Document {
            id: id.to_string(),
            revision: 1,
            body,
        };
        docs.insert(id.to_string(), doc.clone());
        Ok(doc)
    }

    async fn put(
        &self,
        collection: &str,
        id: &str,
        body: serde_json::Value,
        expected_revision: u64,
    ) -> HarvestResult<Document> {
        let mut collections = self.collections.lock().await;
        let Some(doc) = collections.get_mut(collection).and_then(|c| c.get_mut(id)) else {
            return Err(HarvestError::not_found("document", format!("{collection}/{id}")));
        };
        if doc.revision != expected_revision {
            return Err(HarvestError::conflict(
                "document",
                format!("{collection}/{id}"),
                format!(
                    "revision is {}, caller expected {expected_revision}",
                    doc.revision
                ),
            ));
        }
        doc.revision += 1;
        doc.body = body;
        Ok(doc.clone())
    }

    async fn list(&self, collection: &str) -> HarvestResult<Vec<Document>> {
        let collections = self.collections.lock().await;
        Ok(collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }
}
