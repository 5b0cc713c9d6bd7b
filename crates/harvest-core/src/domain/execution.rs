//! Execution record: one run of a Task, spanning its retry attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{HarvestError, HarvestResult};
use super::ids::{DataObjectId, ExecutionId, TaskId};
use super::state::ExecutionStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub task_id: TaskId,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Processor result of the successful attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Data objects produced by this execution. Set semantics.
    #[serde(default)]
    pub output_objects: Vec<DataObjectId>,

    /// Processor invocations so far.
    pub attempts: u32,

    pub max_attempts: u32,
}

impl ExecutionRecord {
    /// A freshly started execution with no attempts yet.
    pub fn start(
        id: ExecutionId,
        task_id: TaskId,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> HarvestResult<Self> {
        let record = Self {
            id,
            task_id,
            status: ExecutionStatus::Running,
            start_time: now,
            end_time: None,
            result: None,
            error_message: None,
            output_objects: Vec::new(),
            attempts: 0,
            max_attempts,
        };
        record.validate()?;
        Ok(record)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn validate(&self) -> HarvestResult<()> {
        if self.max_attempts == 0 {
            return Err(HarvestError::Validation(format!(
                "execution {}: max_attempts must be at least 1",
                self.id
            )));
        }
        if self.attempts > self.max_attempts {
            return Err(HarvestError::Validation(format!(
                "execution {}: attempts {} exceed max_attempts {}",
                self.id, self.attempts, self.max_attempts
            )));
        }
        if self.end_time.is_some() != self.status.is_terminal() {
            return Err(HarvestError::Validation(format!(
                "execution {}: end_time must be set exactly when status is terminal (status {})",
                self.id, self.status
            )));
        }
        if let Some(end) = self.end_time
            && end < self.start_time
        {
            return Err(HarvestError::Validation(format!(
                "execution {}: end_time precedes start_time",
                self.id
            )));
        }
        let mut seen = std::collections::HashSet::new();
        if !self.output_objects.iter().all(|id| seen.insert(*id)) {
            return Err(HarvestError::Validation(format!(
                "execution {}: duplicate output object",
                self.id
            )));
        }
        Ok(())
    }

    fn ensure_open(&self, action: &str) -> HarvestResult<()> {
        if self.is_terminal() {
            return Err(HarvestError::conflict(
                "execution",
                self.id,
                format!("cannot {action}: execution is already {}", self.status),
            ));
        }
        Ok(())
    }

    /// Count one more processor invocation. Returns the new attempt number.
    pub fn begin_attempt(&mut self) -> HarvestResult<u32> {
        self.ensure_open("begin attempt")?;
        if self.attempts >= self.max_attempts {
            return Err(HarvestError::Validation(format!(
                "execution {}: attempt budget of {} exhausted",
                self.id, self.max_attempts
            )));
        }
        self.attempts += 1;
        Ok(self.attempts)
    }

    /// Idempotent set insert. Returns false if the object was already linked.
    pub fn link_output(&mut self, object_id: DataObjectId) -> HarvestResult<bool> {
        if self.output_objects.contains(&object_id) {
            return Ok(false);
        }
        self.ensure_open("link output")?;
        self.output_objects.push(object_id);
        Ok(true)
    }

    pub fn complete(&mut self, result: serde_json::Value, now: DateTime<Utc>) -> HarvestResult<()> {
        self.ensure_open("complete")?;
        self.status = ExecutionStatus::Completed;
        self.result = Some(result);
        self.error_message = None;
        self.end_time = Some(now.max(self.start_time));
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> HarvestResult<()> {
        self.ensure_open("fail")?;
        self.status = ExecutionStatus::Failed;
        self.error_message = Some(message.into());
        self.end_time = Some(now.max(self.start_time));
        Ok(())
    }
}
