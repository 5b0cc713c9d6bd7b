//! Repositories: typed access to task, execution and data object records.
//!
//! Each repository owns one collection of the document store. Updates are
//! read-modify-write loops over the store's revision-checked `put`; a lost
//! race re-reads and re-applies the mutation, so callers never see a stale
//! write succeed.

mod data_object;
mod execution;
mod task;

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::domain::{HarvestError, HarvestResult};
use crate::ports::{Clock, DocumentStore};

pub use data_object::DataObjectRepository;
pub use execution::{ExecutionRepository, Finish};
pub use task::TaskRepository;

pub const TASKS: &str = "tasks";
pub const EXECUTIONS: &str = "executions";
pub const DATA_OBJECTS: &str = "data_objects";

/// Attempts at a conditional write before giving up with `Conflict`.
const MAX_CAS_ATTEMPTS: usize = 8;

/// The three repositories over one document store.
#[derive(Clone)]
pub struct Repositories {
    pub tasks: TaskRepository,
    pub executions: ExecutionRepository,
    pub data_objects: DataObjectRepository,
}

impl Repositories {
    /// `scheme` is the artifact store scheme data object paths must carry.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        scheme: impl Into<String>,
    ) -> Self {
        Self {
            tasks: TaskRepository::new(Arc::clone(&store), Arc::clone(&clock)),
            executions: ExecutionRepository::new(Arc::clone(&store), Arc::clone(&clock)),
            data_objects: DataObjectRepository::new(store, scheme),
        }
    }
}

/// Typed view of one collection.
pub(crate) struct Collection<T> {
    store: Arc<dyn DocumentStore>,
    name: &'static str,
    entity: &'static str,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            name: self.name,
            entity: self.entity,
            _record: PhantomData,
        }
    }
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned + Clone + PartialEq + Send,
{
    pub(crate) fn new(store: Arc<dyn DocumentStore>, name: &'static str, entity: &'static str) -> Self {
        Self {
            store,
            name,
            entity,
            _record: PhantomData,
        }
    }

    pub(crate) async fn find(&self, id: &str) -> HarvestResult<Option<(T, u64)>> {
        let Some(doc) = self.store.get(self.name, id).await? else {
            return Ok(None);
        };
        let record = serde_json::from_value(doc.body).map_err(|e| {
            HarvestError::Document(format!("{} {id} is unreadable: {e}", self.entity))
        })?;
        Ok(Some((record, doc.revision)))
    }

    pub(crate) async fn load(&self, id: &str) -> HarvestResult<(T, u64)> {
        self.find(id)
            .await?
            .ok_or_else(|| HarvestError::not_found(self.entity, id))
    }

    pub(crate) async fn insert(&self, id: &str, record: &T) -> HarvestResult<()> {
        self.store
            .insert(self.name, id, serde_json::to_value(record)?)
            .await?;
        Ok(())
    }

    /// Single conditional write of a caller-built record.
    pub(crate) async fn put(&self, id: &str, record: &T, expected_revision: u64) -> HarvestResult<()> {
        self.store
            .put(self.name, id, serde_json::to_value(record)?, expected_revision)
            .await?;
        Ok(())
    }

    /// Re-read, apply `apply`, write back under the read revision; repeat on a
    /// lost race. Errors from `apply` end the loop unchanged. If `apply` leaves
    /// the record as it was, nothing is written.
    pub(crate) async fn mutate<F>(&self, id: &str, mut apply: F) -> HarvestResult<T>
    where
        F: FnMut(&mut T) -> HarvestResult<()> + Send,
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let (current, revision) = self.load(id).await?;
            let mut next = current.clone();
            apply(&mut next)?;
            if next == current {
                return Ok(next);
            }
            match self.put(id, &next, revision).await {
                Ok(()) => return Ok(next),
                Err(e) if e.is_conflict() => {
                    debug!(entity = self.entity, id, attempt, "revision moved, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(HarvestError::conflict(
            self.entity,
            id,
            format!("gave up after {MAX_CAS_ATTEMPTS} concurrent modifications"),
        ))
    }

    pub(crate) async fn list(&self) -> HarvestResult<Vec<T>> {
        self.store
            .list(self.name)
            .await?
            .into_iter()
            .map(|doc| {
                serde_json::from_value(doc.body).map_err(|e| {
                    HarvestError::Document(format!("{} {} is unreadable: {e}", self.entity, doc.id))
                })
            })
            .collect()
    }
}
