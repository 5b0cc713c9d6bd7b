use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{Collection, TASKS};
use crate::domain::{ExecutionId, HarvestError, HarvestResult, TaskId, TaskRecord, TaskStatus};
use crate::ports::{Clock, DocumentStore};

/// Task records. The only writer of task status.
#[derive(Clone)]
pub struct TaskRepository {
    tasks: Collection<TaskRecord>,
    clock: Arc<dyn Clock>,
}

impl TaskRepository {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            tasks: Collection::new(store, TASKS, "task"),
            clock,
        }
    }

    pub async fn create(&self, task: TaskRecord) -> HarvestResult<TaskRecord> {
        task.validate()?;
        if task.status() != TaskStatus::Pending || !task.execution_history().is_empty() {
            return Err(HarvestError::Validation(format!(
                "task {} must be created pending with an empty history",
                task.id()
            )));
        }
        self.tasks.insert(&task.id().to_string(), &task).await?;
        debug!(task_id = %task.id(), task_type = %task.task_type(), "task created");
        Ok(task)
    }

    pub async fn get(&self, id: TaskId) -> HarvestResult<TaskRecord> {
        Ok(self.tasks.load(&id.to_string()).await?.0)
    }

    /// Write a caller-modified record.
    ///
    /// Rejected with `Conflict` when the stored record is terminal, when an
    /// immutable field changed or when `execution_history` lost entries;
    /// with `TaskState` when the status change is not an allowed transition.
    pub async fn update(&self, task: TaskRecord) -> HarvestResult<TaskRecord> {
        let key = task.id().to_string();
        let (stored, revision) = self.tasks.load(&key).await?;
        if stored == task {
            return Ok(stored);
        }
        if stored.status().is_terminal() {
            return Err(HarvestError::conflict(
                "task",
                task.id(),
                format!("task is {} and can no longer change", stored.status()),
            ));
        }
        if stored.task_type() != task.task_type() || stored.created_at() != task.created_at() {
            return Err(HarvestError::conflict(
                "task",
                task.id(),
                "task_type and created_at are immutable",
            ));
        }
        if task.status() != stored.status() && !stored.status().can_transition_to(task.status()) {
            return Err(HarvestError::TaskState {
                task_id: task.id(),
                from: stored.status(),
                to: task.status(),
            });
        }
        if !stored.history_extends(&task) {
            return Err(HarvestError::conflict(
                "task",
                task.id(),
                "execution_history is append-only",
            ));
        }
        task.validate()?;
        self.tasks.put(&key, &task, revision).await?;
        Ok(task)
    }

    /// Atomic conditional transition: succeeds only if the stored status is one
    /// of `expected` at write time.
    ///
    /// A terminal task yields `TaskState`; a task in some other live status
    /// yields `Conflict` (somebody else moved it first).
    pub async fn transition(
        &self,
        id: TaskId,
        expected: &[TaskStatus],
        to: TaskStatus,
    ) -> HarvestResult<TaskRecord> {
        let record = self
            .tasks
            .mutate(&id.to_string(), |task| {
                let from = task.status();
                if from.is_terminal() {
                    return Err(HarvestError::TaskState { task_id: id, from, to });
                }
                if !expected.contains(&from) {
                    return Err(HarvestError::conflict(
                        "task",
                        id,
                        format!("expected one of {expected:?}, found {from}"),
                    ));
                }
                task.transition(to, self.clock.now())
            })
            .await?;
        info!(task_id = %id, status = %to, "task transitioned");
        Ok(record)
    }

    /// Idempotent append to the task's execution history.
    pub async fn append_execution(
        &self,
        id: TaskId,
        execution_id: ExecutionId,
    ) -> HarvestResult<TaskRecord> {
        self.tasks
            .mutate(&id.to_string(), |task| {
                if task.execution_history().contains(&execution_id) {
                    return Ok(());
                }
                if task.status().is_terminal() {
                    return Err(HarvestError::conflict(
                        "task",
                        id,
                        format!("cannot attach execution to a {} task", task.status()),
                    ));
                }
                task.record_execution(execution_id, self.clock.now());
                Ok(())
            })
            .await
    }

    /// Heartbeat for a running task. `Conflict` if the task is no longer running.
    pub async fn touch(&self, id: TaskId) -> HarvestResult<TaskRecord> {
        self.tasks
            .mutate(&id.to_string(), |task| {
                if task.status() != TaskStatus::Running {
                    return Err(HarvestError::conflict(
                        "task",
                        id,
                        format!("heartbeat on a {} task", task.status()),
                    ));
                }
                task.touch(self.clock.now());
                Ok(())
            })
            .await
    }

    /// Move a running task whose heartbeat is older than `stale_before` back to
    /// pending. Returns `None` if the task is no longer running or was touched
    /// in the meantime.
    pub async fn requeue_stale(
        &self,
        id: TaskId,
        stale_before: DateTime<Utc>,
    ) -> HarvestResult<Option<TaskRecord>> {
        let result = self
            .tasks
            .mutate(&id.to_string(), |task| {
                if task.status() != TaskStatus::Running || task.updated_at() >= stale_before {
                    return Err(HarvestError::conflict("task", id, "no longer stale"));
                }
                task.requeue(self.clock.now())
            })
            .await;
        match result {
            Ok(task) => Ok(Some(task)),
            Err(e) if e.is_conflict() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Tasks with `status`, oldest first (`created_at`, then id).
    pub async fn list_by_status(&self, status: TaskStatus) -> HarvestResult<Vec<TaskRecord>> {
        let mut tasks: Vec<_> = self
            .tasks
            .list()
            .await?
            .into_iter()
            .filter(|t| t.status() == status)
            .collect();
        sort_fifo(&mut tasks);
        Ok(tasks)
    }

    pub async fn list(&self) -> HarvestResult<Vec<TaskRecord>> {
        let mut tasks = self.tasks.list().await?;
        sort_fifo(&mut tasks);
        Ok(tasks)
    }
}

fn sort_fifo(tasks: &mut [TaskRecord]) {
    tasks.sort_by(|a, b| {
        a.created_at()
            .cmp(&b.created_at())
            .then_with(|| a.id().cmp(&b.id()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskConfig, TaskType};
    use crate::impls::InMemoryDocumentStore;
    use crate::ports::FixedClock;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn setup() -> (TaskRepository, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
        ));
        let repo = TaskRepository::new(Arc::new(InMemoryDocumentStore::new()), clock.clone());
        (repo, clock)
    }

    async fn submit(repo: &TaskRepository, clock: &FixedClock) -> TaskRecord {
        let task = TaskRecord::new(
            TaskId::from_uuid(Uuid::new_v4()),
            TaskType::Ocr,
            TaskConfig::new("scan.png"),
            clock.now(),
            None,
        )
        .unwrap();
        repo.create(task).await.unwrap()
    }

    #[tokio::test]
    async fn get_missing_task_is_not_found() {
        let (repo, _) = setup();
        let err = repo.get(TaskId::from_uuid(Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(err, HarvestError::NotFound { entity: "task", .. }));
    }

    #[tokio::test]
    async fn create_rejects_duplicates() {
        let (repo, clock) = setup();
        let task = submit(&repo, &clock).await;
        assert!(repo.create(task).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let (repo, clock) = setup();
        let task = submit(&repo, &clock).await;

        repo.transition(task.id(), &[TaskStatus::Pending], TaskStatus::Running)
            .await
            .unwrap();
        let err = repo
            .transition(task.id(), &[TaskStatus::Pending], TaskStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Conflict { .. }));
    }

    #[tokio::test]
    async fn terminal_task_rejects_transitions() {
        let (repo, clock) = setup();
        let task = submit(&repo, &clock).await;
        repo.transition(task.id(), &[TaskStatus::Pending], TaskStatus::Cancelled)
            .await
            .unwrap();

        let err = repo
            .transition(
                task.id(),
                &[TaskStatus::Pending, TaskStatus::Running],
                TaskStatus::Cancelled,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HarvestError::TaskState { from: TaskStatus::Cancelled, to: TaskStatus::Cancelled, .. }
        ));
    }

    #[tokio::test]
    async fn update_guards_history_and_terminal_records() {
        let (repo, clock) = setup();
        let task = submit(&repo, &clock).await;
        let exec = ExecutionId::from_uuid(Uuid::new_v4());
        let with_history = repo.append_execution(task.id(), exec).await.unwrap();

        // Writing back the pre-append copy would drop the history entry.
        let err = repo.update(task.clone()).await.unwrap_err();
        assert!(err.is_conflict());

        let mut cancelled = with_history.clone();
        cancelled.transition(TaskStatus::Cancelled, clock.now()).unwrap();
        repo.update(cancelled.clone()).await.unwrap();

        let mut touched = cancelled;
        touched.touch(clock.now() + Duration::seconds(1));
        assert!(repo.update(touched).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn append_execution_is_idempotent() {
        let (repo, clock) = setup();
        let task = submit(&repo, &clock).await;
        let exec = ExecutionId::from_uuid(Uuid::new_v4());
        repo.append_execution(task.id(), exec).await.unwrap();
        let again = repo.append_execution(task.id(), exec).await.unwrap();
        assert_eq!(again.execution_history(), &[exec]);
    }

    #[tokio::test]
    async fn requeue_stale_only_touches_stale_running_tasks() {
        let (repo, clock) = setup();
        let task = submit(&repo, &clock).await;
        let cutoff = clock.now() + Duration::seconds(1);

        // Pending: nothing to do.
        assert!(repo.requeue_stale(task.id(), cutoff).await.unwrap().is_none());

        repo.transition(task.id(), &[TaskStatus::Pending], TaskStatus::Running)
            .await
            .unwrap();
        let requeued = repo.requeue_stale(task.id(), cutoff).await.unwrap().unwrap();
        assert_eq!(requeued.status(), TaskStatus::Pending);

        repo.transition(task.id(), &[TaskStatus::Pending], TaskStatus::Running)
            .await
            .unwrap();
        clock.advance(Duration::seconds(5));
        repo.touch(task.id()).await.unwrap();
        assert!(repo.requeue_stale(task.id(), cutoff).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_by_status_is_fifo() {
        let (repo, clock) = setup();
        let first = submit(&repo, &clock).await;
        clock.advance(Duration::seconds(1));
        let second = submit(&repo, &clock).await;
        repo.transition(second.id(), &[TaskStatus::Pending], TaskStatus::Cancelled)
            .await
            .unwrap();
        clock.advance(Duration::seconds(1));
        let third = submit(&repo, &clock).await;

        let pending: Vec<_> = repo
            .list_by_status(TaskStatus::Pending)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id())
            .collect();
        assert_eq!(pending, vec![first.id(), third.id()]);
    }
}
