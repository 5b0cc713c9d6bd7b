use std::sync::Arc;

use tracing::debug;

use super::{Collection, DATA_OBJECTS, EXECUTIONS, TASKS};
use crate::domain::{
    DataObjectId, DataObjectRecord, ExecutionId, ExecutionRecord, ExecutionStatus, HarvestError,
    HarvestResult, TaskId, TaskRecord,
};
use crate::ports::{Clock, DocumentStore};

/// How an execution ends.
#[derive(Debug, Clone, PartialEq)]
pub enum Finish {
    Completed(serde_json::Value),
    Failed(String),
}

#[derive(Clone)]
pub struct ExecutionRepository {
    executions: Collection<ExecutionRecord>,
    tasks: Collection<TaskRecord>,
    objects: Collection<DataObjectRecord>,
    clock: Arc<dyn Clock>,
}

impl ExecutionRepository {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            executions: Collection::new(Arc::clone(&store), EXECUTIONS, "execution"),
            tasks: Collection::new(Arc::clone(&store), TASKS, "task"),
            objects: Collection::new(store, DATA_OBJECTS, "data object"),
            clock,
        }
    }

    /// Persist a new execution. The parent task must exist.
    pub async fn create(&self, execution: ExecutionRecord) -> HarvestResult<ExecutionRecord> {
        execution.validate()?;
        if execution.status != ExecutionStatus::Running || !execution.output_objects.is_empty() {
            return Err(HarvestError::Validation(format!(
                "execution {} must be created running with no outputs",
                execution.id
            )));
        }
        self.tasks.load(&execution.task_id.to_string()).await?;
        self.executions
            .insert(&execution.id.to_string(), &execution)
            .await?;
        debug!(execution_id = %execution.id, task_id = %execution.task_id, "execution created");
        Ok(execution)
    }

    pub async fn get(&self, id: ExecutionId) -> HarvestResult<ExecutionRecord> {
        Ok(self.executions.load(&id.to_string()).await?.0)
    }

    /// Write a caller-modified record. Terminal executions are read-only;
    /// identity fields are immutable, `attempts` never decreases and
    /// `output_objects` never loses entries.
    pub async fn update(&self, execution: ExecutionRecord) -> HarvestResult<ExecutionRecord> {
        let key = execution.id.to_string();
        let (stored, revision) = self.executions.load(&key).await?;
        if stored == execution {
            return Ok(stored);
        }
        let reason = if stored.is_terminal() {
            Some(format!("execution is {} and read-only", stored.status))
        } else if stored.task_id != execution.task_id
            || stored.start_time != execution.start_time
            || stored.max_attempts != execution.max_attempts
        {
            Some("task_id, start_time and max_attempts are immutable".to_string())
        } else if execution.attempts < stored.attempts {
            Some("attempts cannot decrease".to_string())
        } else if !stored
            .output_objects
            .iter()
            .all(|id| execution.output_objects.contains(id))
        {
            Some("output_objects cannot lose entries".to_string())
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(HarvestError::conflict("execution", execution.id, reason));
        }
        execution.validate()?;
        self.executions.put(&key, &execution, revision).await?;
        Ok(execution)
    }

    /// Executions of a task, oldest first.
    pub async fn list_by_task(&self, task_id: TaskId) -> HarvestResult<Vec<ExecutionRecord>> {
        let mut executions: Vec<_> = self
            .executions
            .list()
            .await?
            .into_iter()
            .filter(|e| e.task_id == task_id)
            .collect();
        executions.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        Ok(executions)
    }

    pub async fn list_by_status(
        &self,
        status: ExecutionStatus,
    ) -> HarvestResult<Vec<ExecutionRecord>> {
        let mut executions: Vec<_> = self
            .executions
            .list()
            .await?
            .into_iter()
            .filter(|e| e.status == status)
            .collect();
        executions.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        Ok(executions)
    }

    /// Count one more processor invocation; returns the updated record.
    pub async fn begin_attempt(&self, id: ExecutionId) -> HarvestResult<ExecutionRecord> {
        self.executions
            .mutate(&id.to_string(), |exec| exec.begin_attempt().map(|_| ()))
            .await
    }

    /// Link a stored data object. Idempotent; the object must belong to this
    /// execution.
    pub async fn append_output(
        &self,
        id: ExecutionId,
        object_id: DataObjectId,
    ) -> HarvestResult<ExecutionRecord> {
        let (object, _) = self.objects.load(&object_id.to_string()).await?;
        if object.execution_id() != id {
            return Err(HarvestError::Validation(format!(
                "data object {object_id} belongs to execution {}, not {id}",
                object.execution_id()
            )));
        }
        self.executions
            .mutate(&id.to_string(), |exec| exec.link_output(object_id).map(|_| ()))
            .await
    }

    /// Close a running execution. `Conflict` if it is already terminal.
    pub async fn finish(&self, id: ExecutionId, finish: Finish) -> HarvestResult<ExecutionRecord> {
        let record = self
            .executions
            .mutate(&id.to_string(), |exec| {
                let now = self.clock.now();
                match &finish {
                    Finish::Completed(result) => exec.complete(result.clone(), now),
                    Finish::Failed(message) => exec.fail(message.clone(), now),
                }
            })
            .await?;
        debug!(execution_id = %id, status = %record.status, attempts = record.attempts, "execution finished");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Metadata, TaskConfig, TaskType};
    use crate::impls::InMemoryDocumentStore;
    use crate::ports::SystemClock;
    use crate::repository::Repositories;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    async fn setup() -> (Repositories, TaskId) {
        let repos = Repositories::new(
            Arc::new(InMemoryDocumentStore::new()),
            Arc::new(SystemClock),
            "mem",
        );
        let task = TaskRecord::new(
            TaskId::from_uuid(Uuid::new_v4()),
            TaskType::Scrape,
            TaskConfig::new("https://example.com"),
            Utc::now(),
            None,
        )
        .unwrap();
        let task = repos.tasks.create(task).await.unwrap();
        (repos, task.id())
    }

    fn new_execution(task_id: TaskId) -> ExecutionRecord {
        ExecutionRecord::start(ExecutionId::from_uuid(Uuid::new_v4()), task_id, 3, Utc::now())
            .unwrap()
    }

    async fn store_object(repos: &Repositories, execution_id: ExecutionId) -> DataObjectId {
        let object = DataObjectRecord::new(
            DataObjectId::from_uuid(Uuid::new_v4()),
            execution_id,
            format!("mem://artifacts/{}", Uuid::new_v4()),
            "text/html",
            Metadata::new(),
            "mem",
            Utc::now(),
        )
        .unwrap();
        repos.data_objects.create(object).await.unwrap().id()
    }

    #[tokio::test]
    async fn create_requires_existing_task() {
        let (repos, _) = setup().await;
        let orphan = new_execution(TaskId::from_uuid(Uuid::new_v4()));
        let err = repos.executions.create(orphan).await.unwrap_err();
        assert!(matches!(err, HarvestError::NotFound { entity: "task", .. }));
    }

    #[tokio::test]
    async fn append_output_is_idempotent_and_checks_ownership() {
        let (repos, task_id) = setup().await;
        let exec = repos.executions.create(new_execution(task_id)).await.unwrap();
        let other = repos.executions.create(new_execution(task_id)).await.unwrap();

        let obj = store_object(&repos, exec.id).await;
        repos.executions.append_output(exec.id, obj).await.unwrap();
        let again = repos.executions.append_output(exec.id, obj).await.unwrap();
        assert_eq!(again.output_objects, vec![obj]);

        let err = repos.executions.append_output(other.id, obj).await.unwrap_err();
        assert!(matches!(err, HarvestError::Validation(_)));
    }

    #[tokio::test]
    async fn finished_execution_is_read_only() {
        let (repos, task_id) = setup().await;
        let exec = repos.executions.create(new_execution(task_id)).await.unwrap();
        repos.executions.begin_attempt(exec.id).await.unwrap();

        let done = repos
            .executions
            .finish(exec.id, Finish::Completed(json!({"bytes": 12})))
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert!(done.end_time.is_some());
        assert_eq!(done.attempts, 1);

        let err = repos
            .executions
            .finish(exec.id, Finish::Failed("late".into()))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let mut edited = done.clone();
        edited.error_message = Some("rewrite".into());
        assert!(repos.executions.update(edited).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn update_rejects_dropped_outputs() {
        let (repos, task_id) = setup().await;
        let exec = repos.executions.create(new_execution(task_id)).await.unwrap();
        let obj = store_object(&repos, exec.id).await;
        let linked = repos.executions.append_output(exec.id, obj).await.unwrap();

        let mut dropped = linked.clone();
        dropped.output_objects.clear();
        assert!(repos.executions.update(dropped).await.unwrap_err().is_conflict());

        let mut bumped = linked;
        bumped.attempts = 1;
        assert_eq!(repos.executions.update(bumped).await.unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn list_by_task_and_status() {
        let (repos, task_id) = setup().await;
        let a = repos.executions.create(new_execution(task_id)).await.unwrap();
        let b = repos.executions.create(new_execution(task_id)).await.unwrap();
        repos
            .executions
            .finish(a.id, Finish::Failed("boom".into()))
            .await
            .unwrap();

        assert_eq!(repos.executions.list_by_task(task_id).await.unwrap().len(), 2);
        let running = repos
            .executions
            .list_by_status(ExecutionStatus::Running)
            .await
            .unwrap();
        assert_eq!(running.iter().map(|e| e.id).collect::<Vec<_>>(), vec![b.id]);
    }
}
