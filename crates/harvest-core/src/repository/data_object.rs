use std::sync::Arc;

use tracing::debug;

use super::{Collection, DATA_OBJECTS, EXECUTIONS};
use crate::domain::{
    DataObjectId, DataObjectRecord, ExecutionId, ExecutionRecord, HarvestError, HarvestResult,
};
use crate::ports::DocumentStore;

/// Data object records. Write-once.
#[derive(Clone)]
pub struct DataObjectRepository {
    objects: Collection<DataObjectRecord>,
    executions: Collection<ExecutionRecord>,
    scheme: String,
}

impl DataObjectRepository {
    pub fn new(store: Arc<dyn DocumentStore>, scheme: impl Into<String>) -> Self {
        Self {
            objects: Collection::new(Arc::clone(&store), DATA_OBJECTS, "data object"),
            executions: Collection::new(store, EXECUTIONS, "execution"),
            scheme: scheme.into(),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Persist a new data object. The producing execution must exist and
    /// still be running.
    pub async fn create(&self, object: DataObjectRecord) -> HarvestResult<DataObjectRecord> {
        object.validate(&self.scheme)?;
        let (execution, _) = self
            .executions
            .load(&object.execution_id().to_string())
            .await?;
        if execution.is_terminal() {
            return Err(HarvestError::conflict(
                "execution",
                execution.id,
                format!("cannot add outputs to a {} execution", execution.status),
            ));
        }
        self.objects.insert(&object.id().to_string(), &object).await?;
        debug!(
            object_id = %object.id(),
            execution_id = %object.execution_id(),
            path = object.storage_path(),
            "data object recorded"
        );
        Ok(object)
    }

    pub async fn get(&self, id: DataObjectId) -> HarvestResult<DataObjectRecord> {
        Ok(self.objects.load(&id.to_string()).await?.0)
    }

    /// Records are immutable: writing back an identical record is accepted as
    /// a no-op, any change is a `Conflict`.
    pub async fn update(&self, object: DataObjectRecord) -> HarvestResult<DataObjectRecord> {
        let (stored, _) = self.objects.load(&object.id().to_string()).await?;
        if stored != object {
            return Err(HarvestError::conflict(
                "data object",
                object.id(),
                "data objects are immutable",
            ));
        }
        Ok(stored)
    }

    /// Objects produced by an execution, in creation order.
    pub async fn list_by_execution(
        &self,
        execution_id: ExecutionId,
    ) -> HarvestResult<Vec<DataObjectRecord>> {
        let mut objects: Vec<_> = self
            .objects
            .list()
            .await?
            .into_iter()
            .filter(|o| o.execution_id() == execution_id)
            .collect();
        objects.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(&b.id()))
        });
        Ok(objects)
    }
}
