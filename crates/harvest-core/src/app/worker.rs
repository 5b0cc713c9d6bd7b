//! Worker: drives one task from claim to final status.
//!
//! Flow for `run_task`:
//! 1. claim (`pending -> running`, conditional); a lost claim is a skip
//! 2. create the execution and append it to the task's history
//! 3. per attempt: heartbeat/cancellation checkpoint, count the attempt,
//!    run the processor under a timeout, then checkpoint again before each
//!    artifact is stored and linked to the execution
//! 4. on success or a `Fail` decision: checkpoint once more, finish the
//!    execution, then move the task to its terminal status
//!
//! The execution record doubles as the ownership token: once it is terminal
//! (closed by the reaper, say) this worker stops touching the task.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::processors::ProcessorTable;
use crate::domain::data_object::validate_content_type;
use crate::domain::{
    Artifact, DataObjectId, DataObjectRecord, Decider, Decision, ExecutionId, ExecutionRecord,
    HarvestError, HarvestResult, Metadata, TaskId, TaskRecord, TaskStatus,
};
use crate::ports::{ArtifactStore, Clock, IdGenerator};
use crate::repository::{Finish, Repositories};

/// How a `run_task` call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The task was not pending (another worker claimed it, or it was
    /// cancelled first). No execution was created.
    Skipped,
    Completed { execution_id: ExecutionId },
    Failed {
        execution_id: ExecutionId,
        message: String,
    },
    Cancelled { execution_id: ExecutionId },
    /// The reaper took the task back while this worker still held it.
    Abandoned { execution_id: ExecutionId },
}

/// A failed attempt, with the step it failed in (none for the processor call).
struct AttemptError {
    stage: Option<String>,
    error: HarvestError,
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stage {
            Some(stage) => write!(f, "{stage}: {}", self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

impl From<HarvestError> for AttemptError {
    fn from(error: HarvestError) -> Self {
        Self { stage: None, error }
    }
}

pub struct Worker {
    repos: Repositories,
    artifacts: Arc<dyn ArtifactStore>,
    processors: ProcessorTable,
    decider: Arc<dyn Decider>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    processor_timeout: Duration,
    max_attempts: u32,
}

impl Worker {
    pub fn new(
        repos: Repositories,
        artifacts: Arc<dyn ArtifactStore>,
        processors: ProcessorTable,
        decider: Arc<dyn Decider>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            repos,
            artifacts,
            processors,
            decider,
            clock,
            ids,
            processor_timeout: Duration::from_secs(300),
            max_attempts: 3,
        }
    }

    pub fn with_processor_timeout(mut self, timeout: Duration) -> Self {
        self.processor_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[instrument(skip_all, fields(task_id = %task_id))]
    pub async fn run_task(&self, task_id: TaskId) -> HarvestResult<RunOutcome> {
        let task = match self
            .repos
            .tasks
            .transition(task_id, &[TaskStatus::Pending], TaskStatus::Running)
            .await
        {
            Ok(task) => task,
            Err(e) if e.is_conflict() => {
                debug!(error = %e, "task not claimable, skipping");
                return Ok(RunOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        let execution = ExecutionRecord::start(
            self.ids.generate_execution_id(),
            task_id,
            self.max_attempts,
            self.clock.now(),
        )?;
        let execution_id = execution.id;
        self.repos.executions.create(execution).await?;
        match self.repos.tasks.append_execution(task_id, execution_id).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => return self.stand_down(task_id, execution_id, 0).await,
            Err(e) => return Err(e),
        }
        info!(%execution_id, task_type = %task.task_type(), "execution started");

        let max = self.max_attempts;
        let mut attempt = 0;
        loop {
            if !self.checkpoint(task_id).await? {
                return self.stand_down(task_id, execution_id, attempt).await;
            }
            attempt = match self.repos.executions.begin_attempt(execution_id).await {
                Ok(exec) => exec.attempts,
                Err(e) if e.is_conflict() => {
                    warn!(%execution_id, "execution closed underneath the worker");
                    return Ok(RunOutcome::Abandoned { execution_id });
                }
                Err(e) => return Err(e),
            };
            debug!(attempt, max, "attempt started");

            let failure = match self.attempt(&task, execution_id).await {
                Ok(None) => return self.stand_down(task_id, execution_id, attempt).await,
                Ok(Some(result)) => {
                    if !self.checkpoint(task_id).await? {
                        return self.stand_down(task_id, execution_id, attempt).await;
                    }
                    return self
                        .finalize(task_id, execution_id, Finish::Completed(result))
                        .await;
                }
                Err(failure) => failure,
            };

            match self.decider.decide(attempt, &failure.error) {
                Decision::Retry { delay, reason } if attempt < max => {
                    warn!(attempt, max, error = %failure, ?delay, %reason, "attempt failed, will retry");
                    tokio::time::sleep(delay).await;
                }
                decision => {
                    let message = format!("attempt {attempt}/{max}: {failure}");
                    warn!(attempt, max, error = %message, ?decision, "attempt failed, giving up");
                    if !self.checkpoint(task_id).await? {
                        return self.stand_down(task_id, execution_id, attempt).await;
                    }
                    return self
                        .finalize(task_id, execution_id, Finish::Failed(message))
                        .await;
                }
            }
        }
    }

    /// Heartbeat that also tells whether the task is still ours to run.
    async fn checkpoint(&self, task_id: TaskId) -> HarvestResult<bool> {
        match self.repos.tasks.touch(task_id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// The task left `running` under us: close the execution accordingly.
    async fn stand_down(
        &self,
        task_id: TaskId,
        execution_id: ExecutionId,
        attempt: u32,
    ) -> HarvestResult<RunOutcome> {
        let task = self.repos.tasks.get(task_id).await?;
        let (message, outcome) = match task.status() {
            TaskStatus::Cancelled if attempt == 0 => (
                "cancelled before attempt 1".to_string(),
                RunOutcome::Cancelled { execution_id },
            ),
            TaskStatus::Cancelled => (
                format!("cancelled during attempt {attempt}"),
                RunOutcome::Cancelled { execution_id },
            ),
            other => (
                format!("worker lost the task: status is {other}"),
                RunOutcome::Abandoned { execution_id },
            ),
        };
        self.close_quietly(execution_id, Finish::Failed(message.clone()))
            .await?;
        info!(%execution_id, status = %task.status(), reason = %message, "worker stood down");
        Ok(outcome)
    }

    /// Finish the execution unless somebody already did.
    async fn close_quietly(&self, execution_id: ExecutionId, finish: Finish) -> HarvestResult<()> {
        match self.repos.executions.finish(execution_id, finish).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => {
                debug!(%execution_id, "execution already closed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Execution first, then the task. The task transition is conditional on
    /// `running`, so a concurrent cancel is never overwritten.
    async fn finalize(
        &self,
        task_id: TaskId,
        execution_id: ExecutionId,
        finish: Finish,
    ) -> HarvestResult<RunOutcome> {
        let (target, outcome) = match &finish {
            Finish::Completed(_) => (TaskStatus::Completed, RunOutcome::Completed { execution_id }),
            Finish::Failed(message) => (
                TaskStatus::Failed,
                RunOutcome::Failed {
                    execution_id,
                    message: message.clone(),
                },
            ),
        };

        match self.repos.executions.finish(execution_id, finish).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => return Ok(RunOutcome::Abandoned { execution_id }),
            Err(e) => return Err(e),
        }

        match self
            .repos
            .tasks
            .transition(task_id, &[TaskStatus::Running], target)
            .await
        {
            Ok(_) => {
                info!(%execution_id, status = %target, "task finished");
                Ok(outcome)
            }
            Err(e) if e.is_conflict() => {
                let status = self.repos.tasks.get(task_id).await?.status();
                warn!(%execution_id, %status, "task moved before it could be finalized");
                Ok(match status {
                    TaskStatus::Cancelled => RunOutcome::Cancelled { execution_id },
                    _ => RunOutcome::Abandoned { execution_id },
                })
            }
            Err(e) => Err(e),
        }
    }

    /// `Ok(None)` when the task left `running` while artifacts were stored.
    async fn attempt(
        &self,
        task: &TaskRecord,
        execution_id: ExecutionId,
    ) -> Result<Option<serde_json::Value>, AttemptError> {
        let processor = self.processors.for_type(task.task_type());
        let output =
            match tokio::time::timeout(self.processor_timeout, processor.run(task.config())).await {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(HarvestError::from(e).into()),
                Err(_) => return Err(HarvestError::Timeout(self.processor_timeout).into()),
            };

        let total = output.artifacts.len();
        for (index, artifact) in output.artifacts.into_iter().enumerate() {
            let stage = || Some(format!("storing artifact {} of {total}", index + 1));
            let ours = self
                .checkpoint(task.id())
                .await
                .map_err(|error| AttemptError { stage: stage(), error })?;
            if !ours {
                debug!(stored = index, total, "task left running while storing artifacts");
                return Ok(None);
            }
            self.store_artifact(execution_id, artifact)
                .await
                .map_err(|error| AttemptError { stage: stage(), error })?;
        }
        Ok(Some(output.result))
    }

    /// Store the blob, record its data object and link it to the execution.
    async fn store_artifact(
        &self,
        execution_id: ExecutionId,
        artifact: Artifact,
    ) -> HarvestResult<DataObjectId> {
        validate_content_type(&artifact.content_type)?;
        let metadata = Metadata::try_from(artifact.metadata)?;
        let path = self
            .artifacts
            .store(&artifact.bytes, &artifact.content_type, &metadata)
            .await?;

        let object = DataObjectRecord::new(
            self.ids.generate_data_object_id(),
            execution_id,
            path,
            artifact.content_type,
            metadata,
            self.artifacts.scheme(),
            self.clock.now(),
        )?;
        let object = self.repos.data_objects.create(object).await?;
        self.repos
            .executions
            .append_output(execution_id, object.id())
            .await?;
        debug!(object_id = %object.id(), path = object.storage_path(), "artifact stored");
        Ok(object.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        DefaultDecider, ExecutionStatus, ProcessorError, ProcessorOutput, RawValue, RetryPolicy,
        TaskConfig, TaskType,
    };
    use crate::impls::{InMemoryArtifactStore, InMemoryDocumentStore};
    use crate::ports::{Document, DocumentStore, Processor, SystemClock, UuidGenerator};
    use crate::repository::{EXECUTIONS, TASKS};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    /// Returns the scripted results in order, then repeats the last one.
    struct Scripted {
        calls: AtomicU32,
        script: Vec<Result<ProcessorOutput, ProcessorError>>,
    }

    impl Scripted {
        fn new(script: Vec<Result<ProcessorOutput, ProcessorError>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                script,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Processor for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn run(&self, _config: &TaskConfig) -> Result<ProcessorOutput, ProcessorError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            self.script[n.min(self.script.len() - 1)].clone()
        }
    }

    fn fast_retries() -> Arc<DefaultDecider> {
        Arc::new(DefaultDecider::new(RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryPolicy::default()
        }))
    }

    async fn setup(processor: Arc<Scripted>) -> (Worker, Repositories, TaskId) {
        setup_with_store(processor, Arc::new(InMemoryDocumentStore::new())).await
    }

    async fn setup_with_store(
        processor: Arc<Scripted>,
        store: Arc<dyn DocumentStore>,
    ) -> (Worker, Repositories, TaskId) {
        let repos = Repositories::new(store, Arc::new(SystemClock), "mem");
        let worker = Worker::new(
            repos.clone(),
            Arc::new(InMemoryArtifactStore::new()),
            ProcessorTable::new(processor.clone(), processor),
            fast_retries(),
            Arc::new(SystemClock),
            Arc::new(UuidGenerator),
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
        (worker, repos, task.id())
    }

    #[tokio::test]
    async fn transient_failure_then_success_reuses_the_execution() {
        let processor = Scripted::new(vec![
            Err(ProcessorError::transient("503")),
            Ok(ProcessorOutput::new(serde_json::json!({"ok": true}))),
        ]);
        let (worker, repos, task_id) = setup(processor.clone()).await;

        let outcome = worker.run_task(task_id).await.unwrap();
        let RunOutcome::Completed { execution_id } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        let exec = repos.executions.get(execution_id).await.unwrap();
        assert_eq!(exec.attempts, 2);
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(processor.calls(), 2);
        assert_eq!(repos.tasks.get(task_id).await.unwrap().execution_history(), &[execution_id]);
    }

    #[tokio::test]
    async fn second_run_of_a_claimed_task_is_skipped() {
        let processor = Scripted::new(vec![Ok(ProcessorOutput::new(serde_json::Value::Null))]);
        let (worker, repos, task_id) = setup(processor).await;

        assert!(matches!(
            worker.run_task(task_id).await.unwrap(),
            RunOutcome::Completed { .. }
        ));
        assert_eq!(worker.run_task(task_id).await.unwrap(), RunOutcome::Skipped);
        assert_eq!(repos.executions.list_by_task(task_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn binary_metadata_fails_the_execution_at_the_storing_step() {
        let output = ProcessorOutput::new(serde_json::Value::Null)
            .with_artifact(Artifact::new("ok", "text/plain"))
            .with_artifact(Artifact::new("bad", "text/plain").with_metadata("raw", RawValue::Bytes(vec![1])));
        let processor = Scripted::new(vec![Ok(output)]);
        let (worker, repos, task_id) = setup(processor.clone()).await;

        let outcome = worker.run_task(task_id).await.unwrap();
        let RunOutcome::Failed { execution_id, message } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert!(message.starts_with("attempt 1/3: storing artifact 2 of 2"), "{message}");
        assert_eq!(processor.calls(), 1);

        // The first artifact stays linked.
        let exec = repos.executions.get(execution_id).await.unwrap();
        assert_eq!(exec.output_objects.len(), 1);
        assert_eq!(exec.error_message.as_deref(), Some(message.as_str()));
        assert_eq!(repos.tasks.get(task_id).await.unwrap().status(), TaskStatus::Failed);
    }

    /// Cancels the task as soon as the first artifact lands.
    struct CancelOnFirstStore {
        inner: InMemoryArtifactStore,
        repos: Repositories,
        task_id: TaskId,
        stores: AtomicU32,
    }

    #[async_trait]
    impl ArtifactStore for CancelOnFirstStore {
        fn scheme(&self) -> &str {
            self.inner.scheme()
        }

        async fn store(
            &self,
            bytes: &[u8],
            content_type: &str,
            metadata: &Metadata,
        ) -> HarvestResult<String> {
            let path = self.inner.store(bytes, content_type, metadata).await?;
            if self.stores.fetch_add(1, Ordering::SeqCst) == 0 {
                self.repos
                    .tasks
                    .transition(self.task_id, &[TaskStatus::Running], TaskStatus::Cancelled)
                    .await?;
            }
            Ok(path)
        }

        async fn retrieve(&self, path: &str) -> HarvestResult<Vec<u8>> {
            self.inner.retrieve(path).await
        }

        async fn delete(&self, path: &str) -> HarvestResult<bool> {
            self.inner.delete(path).await
        }
    }

    #[tokio::test]
    async fn cancel_while_storing_stops_before_the_next_artifact() {
        let output = ProcessorOutput::new(serde_json::Value::Null)
            .with_artifact(Artifact::new("one", "text/plain"))
            .with_artifact(Artifact::new("two", "text/plain"))
            .with_artifact(Artifact::new("three", "text/plain"));
        let processor = Scripted::new(vec![Ok(output)]);
        let (worker, repos, task_id) = setup(processor.clone()).await;
        let store = Arc::new(CancelOnFirstStore {
            inner: InMemoryArtifactStore::new(),
            repos: repos.clone(),
            task_id,
            stores: AtomicU32::new(0),
        });
        let worker = Worker {
            artifacts: store.clone(),
            ..worker
        };

        let outcome = worker.run_task(task_id).await.unwrap();
        let RunOutcome::Cancelled { execution_id } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(store.stores.load(Ordering::SeqCst), 1);
        assert_eq!(processor.calls(), 1);

        let exec = repos.executions.get(execution_id).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.output_objects.len(), 1);
        assert_eq!(exec.error_message.as_deref(), Some("cancelled during attempt 1"));
        assert_eq!(repos.tasks.get(task_id).await.unwrap().status(), TaskStatus::Cancelled);
    }

    /// Cancels the task right after its execution is written as completed,
    /// between the two finalize writes.
    struct CancelAfterExecutionCompletes {
        inner: InMemoryDocumentStore,
    }

    #[async_trait]
    impl DocumentStore for CancelAfterExecutionCompletes {
        async fn get(&self, collection: &str, id: &str) -> HarvestResult<Option<Document>> {
            self.inner.get(collection, id).await
        }

        async fn insert(
            &self,
            collection: &str,
            id: &str,
            body: serde_json::Value,
        ) -> HarvestResult<Document> {
            self.inner.insert(collection, id, body).await
        }

        async fn put(
            &self,
            collection: &str,
            id: &str,
            body: serde_json::Value,
            expected_revision: u64,
        ) -> HarvestResult<Document> {
            let completed_task = (collection == EXECUTIONS && body["status"] == "completed")
                .then(|| serde_json::from_value::<TaskId>(body["task_id"].clone()).ok())
                .flatten()
                .map(|task_id| task_id.to_string());
            let doc = self.inner.put(collection, id, body, expected_revision).await?;
            if let Some(task_id) = completed_task {
                let mut task = self.inner.get(TASKS, &task_id).await?.unwrap();
                task.body["status"] = serde_json::json!("cancelled");
                self.inner.put(TASKS, &task_id, task.body, task.revision).await?;
            }
            Ok(doc)
        }

        async fn list(&self, collection: &str) -> HarvestResult<Vec<Document>> {
            self.inner.list(collection).await
        }
    }

    #[tokio::test]
    async fn cancel_landing_during_finalize_is_not_overwritten() {
        let processor = Scripted::new(vec![Ok(ProcessorOutput::new(serde_json::json!({"ok": true})))]);
        let store = Arc::new(CancelAfterExecutionCompletes {
            inner: InMemoryDocumentStore::new(),
        });
        let (worker, repos, task_id) = setup_with_store(processor, store).await;

        let outcome = worker.run_task(task_id).await.unwrap();
        let RunOutcome::Cancelled { execution_id } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(repos.tasks.get(task_id).await.unwrap().status(), TaskStatus::Cancelled);
        let exec = repos.executions.get(execution_id).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn slow_processor_times_out_as_transient() {
        struct Sleepy;

        #[async_trait]
        impl Processor for Sleepy {
            fn name(&self) -> &'static str {
                "sleepy"
            }

            async fn run(&self, _config: &TaskConfig) -> Result<ProcessorOutput, ProcessorError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(ProcessorOutput::new(serde_json::Value::Null))
            }
        }

        let (worker, repos, task_id) = setup(Scripted::new(vec![])).await;
        let worker = Worker {
            processors: ProcessorTable::new(Arc::new(Sleepy), Arc::new(Sleepy)),
            ..worker
        }
        .with_processor_timeout(Duration::from_millis(10));

        let outcome = worker.run_task(task_id).await.unwrap();
        let RunOutcome::Failed { execution_id, message } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert!(message.starts_with("attempt 3/3: processor timed out"), "{message}");
        assert_eq!(repos.executions.get(execution_id).await.unwrap().attempts, 3);
    }
}
