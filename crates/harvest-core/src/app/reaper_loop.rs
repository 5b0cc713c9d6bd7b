//! ReaperLoop: returns running tasks with an expired heartbeat to pending.
//!
//! A worker touches its task before every attempt. A task whose `updated_at`
//! is older than `stale_after` is assumed orphaned (the worker crashed or the
//! process was killed). Requeueing it closes its open executions as failed,
//! which also tells a still-alive worker that it lost the task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::domain::{ExecutionStatus, HarvestResult, TaskId, TaskRecord, TaskStatus};
use crate::ports::Clock;
use crate::repository::{ExecutionRepository, Finish, TaskRepository};

/// Failure message written to executions closed by the reaper.
pub const ABANDONED_MESSAGE: &str = "abandoned: worker heartbeat expired";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub requeued: Vec<TaskId>,
    pub closed_executions: usize,
}

pub struct ReaperLoop {
    tasks: TaskRepository,
    executions: ExecutionRepository,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
    interval: Duration,
}

impl ReaperLoop {
    pub fn new(
        tasks: TaskRepository,
        executions: ExecutionRepository,
        clock: Arc<dyn Clock>,
        stale_after: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            tasks,
            executions,
            clock,
            stale_after,
            interval,
        }
    }

    #[instrument(skip_all)]
    pub async fn reap_once(&self) -> HarvestResult<ReapReport> {
        let stale_after = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let stale_before = self
            .clock
            .now()
            .checked_sub_signed(stale_after)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

        let mut report = ReapReport::default();
        for task in self.tasks.list_by_status(TaskStatus::Running).await? {
            if task.updated_at() >= stale_before {
                continue;
            }
            // Re-checked under CAS; a heartbeat since the listing wins.
            let Some(requeued) = self.tasks.requeue_stale(task.id(), stale_before).await? else {
                continue;
            };
            report.closed_executions += self.close_open_executions(&requeued).await?;
            warn!(
                task_id = %requeued.id(),
                last_heartbeat = %task.updated_at(),
                "stale task requeued"
            );
            report.requeued.push(requeued.id());
        }
        if !report.requeued.is_empty() {
            info!(
                requeued = report.requeued.len(),
                closed_executions = report.closed_executions,
                "reaper pass"
            );
        }
        Ok(report)
    }

    async fn close_open_executions(&self, task: &TaskRecord) -> HarvestResult<usize> {
        let mut closed = 0;
        for &execution_id in task.execution_history() {
            let execution = self.executions.get(execution_id).await?;
            if execution.status != ExecutionStatus::Running {
                continue;
            }
            match self
                .executions
                .finish(execution_id, Finish::Failed(ABANDONED_MESSAGE.to_string()))
                .await
            {
                Ok(_) => closed += 1,
                // The worker finished it between our read and write.
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(closed)
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval = ?self.interval, stale_after = ?self.stale_after, "reaper started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if let Err(e) = self.reap_once().await {
                warn!(error = %e, "reaper pass failed");
            }
        }
        info!("reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionId, ExecutionRecord, TaskConfig, TaskRecord, TaskType};
    use crate::impls::InMemoryDocumentStore;
    use crate::ports::FixedClock;
    use crate::repository::Repositories;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use uuid::Uuid;

    struct Fixture {
        repos: Repositories,
        clock: Arc<FixedClock>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
            Self {
                repos: Repositories::new(Arc::new(InMemoryDocumentStore::new()), clock.clone(), "mem"),
                clock,
            }
        }

        fn reaper(&self) -> ReaperLoop {
            ReaperLoop::new(
                self.repos.tasks.clone(),
                self.repos.executions.clone(),
                self.clock.clone(),
                Duration::from_secs(60),
                Duration::from_millis(10),
            )
        }

        /// A claimed task with one open execution, as a worker would leave it.
        async fn running_task(&self) -> (TaskId, ExecutionId) {
            let task = TaskRecord::new(
                TaskId::from_uuid(Uuid::new_v4()),
                TaskType::Scrape,
                TaskConfig::new("https://example.com"),
                self.clock.now(),
                None,
            )
            .unwrap();
            let task_id = self.repos.tasks.create(task).await.unwrap().id();
            self.repos
                .tasks
                .transition(task_id, &[TaskStatus::Pending], TaskStatus::Running)
                .await
                .unwrap();
            let exec = ExecutionRecord::start(
                ExecutionId::from_uuid(Uuid::new_v4()),
                task_id,
                3,
                self.clock.now(),
            )
            .unwrap();
            let exec_id = self.repos.executions.create(exec).await.unwrap().id;
            self.repos
                .tasks
                .append_execution(task_id, exec_id)
                .await
                .unwrap();
            (task_id, exec_id)
        }
    }

    #[tokio::test]
    async fn stale_task_is_requeued_and_its_execution_closed() {
        let fx = Fixture::new();
        let (task_id, exec_id) = fx.running_task().await;
        fx.clock.advance(ChronoDuration::seconds(61));

        let report = fx.reaper().reap_once().await.unwrap();
        assert_eq!(report.requeued, vec![task_id]);
        assert_eq!(report.closed_executions, 1);

        let task = fx.repos.tasks.get(task_id).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(task.scheduled_at().is_none());
        assert_eq!(task.execution_history(), &[exec_id]);

        let exec = fx.repos.executions.get(exec_id).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.error_message.as_deref(), Some(ABANDONED_MESSAGE));
    }

    #[tokio::test]
    async fn recent_heartbeat_keeps_the_task_running() {
        let fx = Fixture::new();
        let (task_id, _) = fx.running_task().await;
        fx.clock.advance(ChronoDuration::seconds(45));
        fx.repos.tasks.touch(task_id).await.unwrap();
        fx.clock.advance(ChronoDuration::seconds(45));

        let report = fx.reaper().reap_once().await.unwrap();
        assert!(report.requeued.is_empty());
        assert_eq!(
            fx.repos.tasks.get(task_id).await.unwrap().status(),
            TaskStatus::Running
        );
    }

    #[tokio::test]
    async fn finished_executions_are_left_alone() {
        let fx = Fixture::new();
        let (task_id, exec_id) = fx.running_task().await;
        fx.repos
            .executions
            .finish(exec_id, Finish::Failed("boom".into()))
            .await
            .unwrap();
        fx.clock.advance(ChronoDuration::minutes(5));

        let report = fx.reaper().reap_once().await.unwrap();
        assert_eq!(report.requeued, vec![task_id]);
        assert_eq!(report.closed_executions, 0);
        let exec = fx.repos.executions.get(exec_id).await.unwrap();
        assert_eq!(exec.error_message.as_deref(), Some("boom"));
    }
}
