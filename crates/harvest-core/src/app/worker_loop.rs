//! Worker pool: a bounded dispatch channel and the tasks draining it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::worker::{RunOutcome, Worker};
use crate::domain::{HarvestError, HarvestResult, TaskId};
use crate::ports::Dispatcher;

type Queued = Arc<StdMutex<HashSet<TaskId>>>;

/// Create the scheduler-side and worker-side ends of the dispatch channel.
pub fn dispatch_channel(capacity: usize) -> (ChannelDispatcher, DispatchReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let queued: Queued = Arc::default();
    (
        ChannelDispatcher {
            tx,
            queued: Arc::clone(&queued),
        },
        DispatchReceiver {
            rx: Mutex::new(rx),
            queued,
        },
    )
}

fn lock(queued: &Queued) -> std::sync::MutexGuard<'_, HashSet<TaskId>> {
    queued.lock().unwrap_or_else(|e| e.into_inner())
}

/// `Dispatcher` over a bounded mpsc channel.
///
/// A task already waiting in the channel is not queued twice; a full or
/// closed channel is reported as `HarvestError::Dispatch`.
#[derive(Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<TaskId>,
    queued: Queued,
}

impl Dispatcher for ChannelDispatcher {
    fn dispatch(&self, task_id: TaskId) -> HarvestResult<()> {
        if !lock(&self.queued).insert(task_id) {
            return Ok(());
        }
        self.tx.try_send(task_id).map_err(|e| {
            lock(&self.queued).remove(&task_id);
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "worker queue is full",
                mpsc::error::TrySendError::Closed(_) => "worker pool is shut down",
            };
            HarvestError::Dispatch {
                task_id,
                reason: reason.to_string(),
            }
        })
    }
}

/// Shared receiving end; workers take turns pulling from it.
pub struct DispatchReceiver {
    rx: Mutex<mpsc::Receiver<TaskId>>,
    queued: Queued,
}

impl DispatchReceiver {
    /// `None` once every dispatcher is gone and the channel is drained.
    pub async fn recv(&self) -> Option<TaskId> {
        let task_id = self.rx.lock().await.recv().await?;
        lock(&self.queued).remove(&task_id);
        Some(task_id)
    }
}

/// Worker group handle.
/// - on shutdown each worker finishes its in-flight task, then exits
/// - `join()` waits for all of them
pub struct WorkerGroup {
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers sharing `receiver`.
    pub fn spawn(
        n: usize,
        receiver: Arc<DispatchReceiver>,
        worker: Arc<Worker>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let joins = (0..n)
            .map(|worker_id| {
                let receiver = Arc::clone(&receiver);
                let worker = Arc::clone(&worker);
                let mut rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, receiver, worker, &mut rx).await;
                })
            })
            .collect();
        Self { joins }
    }

    pub async fn join(self) {
        for j in self.joins {
            let _ = j.await;
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<DispatchReceiver>,
    worker: Arc<Worker>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    debug!(worker_id, "worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // Waiting for work races with shutdown; running a task does not.
        let next = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            next = receiver.recv() => next,
        };
        let Some(task_id) = next else {
            break;
        };

        match worker.run_task(task_id).await {
            Ok(RunOutcome::Skipped) => {}
            Ok(outcome) => debug!(worker_id, %task_id, ?outcome, "task run finished"),
            // The task stays running; the reaper will hand it out again.
            Err(e) => error!(worker_id, %task_id, error = %e, "task run aborted"),
        }
    }
    info!(worker_id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn task_id() -> TaskId {
        TaskId::from_uuid(Uuid::new_v4())
    }

    #[tokio::test]
    async fn full_channel_is_a_dispatch_error() {
        let (dispatcher, receiver) = dispatch_channel(1);
        let first = task_id();
        let second = task_id();

        dispatcher.dispatch(first).unwrap();
        let err = dispatcher.dispatch(second).unwrap_err();
        assert!(matches!(err, HarvestError::Dispatch { task_id, .. } if task_id == second));

        assert_eq!(receiver.recv().await, Some(first));
        dispatcher.dispatch(second).unwrap();
        assert_eq!(receiver.recv().await, Some(second));
    }

    #[tokio::test]
    async fn queued_task_is_not_sent_twice() {
        let (dispatcher, receiver) = dispatch_channel(4);
        let id = task_id();
        dispatcher.dispatch(id).unwrap();
        dispatcher.dispatch(id).unwrap();
        drop(dispatcher);

        assert_eq!(receiver.recv().await, Some(id));
        assert_eq!(receiver.recv().await, None);
    }

    #[tokio::test]
    async fn closed_channel_is_a_dispatch_error() {
        let (dispatcher, receiver) = dispatch_channel(4);
        drop(receiver);
        assert!(matches!(
            dispatcher.dispatch(task_id()),
            Err(HarvestError::Dispatch { .. })
        ));
    }
}
