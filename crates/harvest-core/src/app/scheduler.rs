//! Scheduler: polls for eligible pending tasks and dispatches them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::domain::HarvestResult;
use crate::ports::{Clock, Dispatcher};
use crate::repository::TaskRepository;

/// What one scheduling pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Pending tasks whose `scheduled_at` has passed.
    pub eligible: usize,
    pub dispatched: usize,
    /// Left pending because the worker pool refused them.
    pub deferred: usize,
}

pub struct Scheduler {
    tasks: TaskRepository,
    dispatcher: Arc<dyn Dispatcher>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(
        tasks: TaskRepository,
        dispatcher: Arc<dyn Dispatcher>,
        clock: Arc<dyn Clock>,
        batch_size: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            tasks,
            dispatcher,
            clock,
            batch_size,
            poll_interval,
        }
    }

    /// Dispatch up to `batch_size` eligible tasks, oldest first.
    ///
    /// Stops at the first refused dispatch: the pool is full, and the rest of
    /// the batch would be refused too. Refused tasks stay pending.
    #[instrument(skip_all)]
    pub async fn run_pass(&self) -> HarvestResult<PassReport> {
        let now = self.clock.now();
        // list_by_status is already ordered by created_at, then id.
        let eligible: Vec<_> = self
            .tasks
            .list_by_status(crate::domain::TaskStatus::Pending)
            .await?
            .into_iter()
            .filter(|task| task.is_eligible(now))
            .collect();

        let mut report = PassReport {
            eligible: eligible.len(),
            ..PassReport::default()
        };
        for task in eligible.iter().take(self.batch_size) {
            match self.dispatcher.dispatch(task.id()) {
                Ok(()) => report.dispatched += 1,
                Err(e) => {
                    report.deferred = eligible.len().min(self.batch_size) - report.dispatched;
                    debug!(task_id = %task.id(), error = %e, "dispatch refused, deferring rest of batch");
                    break;
                }
            }
        }
        if report.dispatched > 0 {
            debug!(?report, "scheduling pass");
        }
        Ok(report)
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(poll_interval = ?self.poll_interval, batch_size = self.batch_size, "scheduler started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            if let Err(e) = self.run_pass().await {
                warn!(error = %e, "scheduling pass failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopped");
    }
}
