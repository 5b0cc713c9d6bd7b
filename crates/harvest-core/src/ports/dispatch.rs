//! Dispatcher port - hands a task ID to the worker pool.

use crate::domain::{HarvestResult, TaskId};

/// Non-blocking hand-off from the scheduler to workers.
///
/// A failed dispatch (`HarvestError::Dispatch`) leaves the task pending for
/// the next scheduler pass and does not consume retry budget.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, task_id: TaskId) -> HarvestResult<()>;
}
