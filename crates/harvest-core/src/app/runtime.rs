//! Engine: the operations surface used by the CLI and embedders, and the
//! handle to the running scheduler, worker pool and reaper.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use super::reaper_loop::ReaperLoop;
use super::scheduler::Scheduler;
use super::status::{ExecutionReport, TaskReport};
use super::worker::Worker;
use super::worker_loop::{WorkerGroup, dispatch_channel};
use crate::config::HarvestConfig;
use crate::domain::{
    DataObjectId, DataObjectRecord, ExecutionId, ExecutionRecord, HarvestResult, TaskConfig,
    TaskId, TaskRecord, TaskStatus, TaskType,
};
use crate::observability::TaskCounts;
use crate::ports::{ArtifactStore, Clock, IdGenerator};
use crate::repository::{Repositories, TaskRepository};

pub struct Engine {
    config: HarvestConfig,
    repos: Repositories,
    artifacts: Arc<dyn ArtifactStore>,
    worker: Arc<Worker>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl Engine {
    pub(crate) fn from_parts(
        config: HarvestConfig,
        repos: Repositories,
        artifacts: Arc<dyn ArtifactStore>,
        worker: Arc<Worker>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            config,
            repos,
            artifacts,
            worker,
            clock,
            ids,
        }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    /// The worker the pool runs; exposed for driving single tasks by hand.
    pub fn worker(&self) -> Arc<Worker> {
        Arc::clone(&self.worker)
    }

    /// Create a pending task. `not_before` delays its first dispatch.
    #[instrument(skip(self, config), fields(source = %config.source))]
    pub async fn submit(
        &self,
        task_type: TaskType,
        config: TaskConfig,
        not_before: Option<DateTime<Utc>>,
    ) -> HarvestResult<TaskRecord> {
        let task = TaskRecord::new(
            self.ids.generate_task_id(),
            task_type,
            config,
            self.clock.now(),
            not_before,
        )?;
        let task = self.repos.tasks.create(task).await?;
        info!(task_id = %task.id(), %task_type, "task submitted");
        Ok(task)
    }

    /// Cancel a pending or running task. A running task's worker notices at
    /// its next checkpoint; terminal tasks return `TaskState`.
    pub async fn cancel(&self, task_id: TaskId) -> HarvestResult<TaskRecord> {
        self.repos
            .tasks
            .transition(
                task_id,
                &[TaskStatus::Pending, TaskStatus::Running],
                TaskStatus::Cancelled,
            )
            .await
    }

    pub async fn task(&self, task_id: TaskId) -> HarvestResult<TaskRecord> {
        self.repos.tasks.get(task_id).await
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> HarvestResult<Vec<TaskRecord>> {
        match status {
            Some(status) => self.repos.tasks.list_by_status(status).await,
            None => self.repos.tasks.list().await,
        }
    }

    pub async fn executions(&self, task_id: TaskId) -> HarvestResult<Vec<ExecutionRecord>> {
        self.repos.tasks.get(task_id).await?;
        self.repos.executions.list_by_task(task_id).await
    }

    pub async fn data_objects(
        &self,
        execution_id: ExecutionId,
    ) -> HarvestResult<Vec<DataObjectRecord>> {
        self.repos.executions.get(execution_id).await?;
        self.repos.data_objects.list_by_execution(execution_id).await
    }

    /// A data object record with its stored bytes.
    pub async fn retrieve_object(
        &self,
        object_id: DataObjectId,
    ) -> HarvestResult<(DataObjectRecord, Vec<u8>)> {
        let object = self.repos.data_objects.get(object_id).await?;
        let bytes = self.artifacts.retrieve(object.storage_path()).await?;
        Ok((object, bytes))
    }

    pub async fn counts(&self) -> HarvestResult<TaskCounts> {
        Ok(TaskCounts::from_statuses(
            self.repos.tasks.list().await?.iter().map(|t| t.status()),
        ))
    }

    pub async fn report(&self, task_id: TaskId) -> HarvestResult<TaskReport> {
        let task = self.repos.tasks.get(task_id).await?;
        let mut executions = Vec::new();
        for execution in self.repos.executions.list_by_task(task_id).await? {
            let objects = self.repos.data_objects.list_by_execution(execution.id).await?;
            executions.push(ExecutionReport { execution, objects });
        }
        Ok(TaskReport { task, executions })
    }

    /// Spawn the scheduler, `worker.concurrency` workers and the reaper.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> EngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatcher, receiver) = dispatch_channel(self.config.worker.queue_capacity);

        let scheduler = Scheduler::new(
            self.repos.tasks.clone(),
            Arc::new(dispatcher),
            Arc::clone(&self.clock),
            self.config.scheduler.batch_size,
            self.config.poll_interval(),
        );
        let reaper = ReaperLoop::new(
            self.repos.tasks.clone(),
            self.repos.executions.clone(),
            Arc::clone(&self.clock),
            self.config.stale_after(),
            self.config.reaper_interval(),
        );
        let workers = WorkerGroup::spawn(
            self.config.worker.concurrency,
            Arc::new(receiver),
            Arc::clone(&self.worker),
            shutdown_rx.clone(),
        );
        let scheduler = tokio::spawn(scheduler.run(shutdown_rx.clone()));
        let reaper = tokio::spawn(reaper.run(shutdown_rx));

        info!(
            concurrency = self.config.worker.concurrency,
            queue_capacity = self.config.worker.queue_capacity,
            "engine started"
        );
        EngineHandle {
            shutdown_tx,
            scheduler,
            reaper,
            workers,
            tasks: self.repos.tasks.clone(),
            poll_interval: self.config.poll_interval(),
        }
    }
}

/// Running engine. Dropping it without `shutdown_and_join` leaves the
/// background tasks running until the runtime stops.
pub struct EngineHandle {
    shutdown_tx: watch::Sender<bool>,
    scheduler: JoinHandle<()>,
    reaper: JoinHandle<()>,
    workers: WorkerGroup,
    tasks: TaskRepository,
    poll_interval: Duration,
}

impl EngineHandle {
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Signal shutdown and wait for every loop to exit. Workers finish the
    /// task they are running first; dispatched but unclaimed tasks stay
    /// pending.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.scheduler.await;
        let _ = self.reaper.await;
        self.workers.join().await;
        info!("engine stopped");
    }

    /// Resolve once no task is pending or running. Tasks deferred by
    /// `not_before` count as pending, so this waits for them too.
    pub async fn wait_idle(&self) -> HarvestResult<TaskCounts> {
        loop {
            let tasks = self.tasks.list().await?;
            let counts = TaskCounts::from_statuses(tasks.iter().map(|t| t.status()));
            if counts.is_idle() {
                return Ok(counts);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
