//! Errors and their operational classification.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::TaskId;
use super::state::TaskStatus;

/// Operational classification of an error.
///
/// - Transient: retry may succeed (timeouts, temporary unavailability)
/// - Permanent: retrying is pointless (bad input, illegal transition)
/// - Infrastructure: the engine's own persistence failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// How a processor classifies its own failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorErrorKind {
    /// Network hiccup, upstream 5xx, rate limiting.
    Transient,
    /// The source cannot be processed (404, unreadable file, tool crashed).
    Permanent,
    /// The task configuration itself is invalid.
    Validation,
}

/// Failure reported by a scrape/OCR processor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?} processor failure: {message}")]
pub struct ProcessorError {
    pub kind: ProcessorErrorKind,
    pub message: String,
}

impl ProcessorError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProcessorErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ProcessorErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: ProcessorErrorKind::Validation,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("task {task_id} cannot move from {from} to {to}")]
    TaskState {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflicting update on {entity} {id}: {reason}")]
    Conflict {
        entity: &'static str,
        id: String,
        reason: String,
    },

    #[error("storage error at {path}: {message}")]
    Storage {
        path: String,
        message: String,
        transient: bool,
    },

    #[error(transparent)]
    Processor(#[from] ProcessorError),

    #[error("processor timed out after {0:?}")]
    Timeout(Duration),

    #[error("document store error: {0}")]
    Document(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("dispatch of task {task_id} failed: {reason}")]
    Dispatch { task_id: TaskId, reason: String },
}

pub type HarvestResult<T> = Result<T, HarvestError>;

impl HarvestError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(entity: &'static str, id: impl ToString, reason: impl Into<String>) -> Self {
        Self::Conflict {
            entity,
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn storage(path: impl Into<String>, message: impl Into<String>, transient: bool) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            transient,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            HarvestError::Storage { transient: true, .. } | HarvestError::Timeout(_) => {
                ErrorKind::Transient
            }
            HarvestError::Processor(e) if e.kind == ProcessorErrorKind::Transient => {
                ErrorKind::Transient
            }
            HarvestError::Document(_) | HarvestError::Storage { .. } => ErrorKind::Infrastructure,
            _ => ErrorKind::Permanent,
        }
    }

    /// Only transient failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Lost a race on a conditional update (or the record already moved on).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            HarvestError::Conflict { .. } | HarvestError::TaskState { .. }
        )
    }
}

impl From<serde_json::Error> for HarvestError {
    fn from(err: serde_json::Error) -> Self {
        HarvestError::Document(format!("serialization: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn classification() {
        assert!(HarvestError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(HarvestError::from(ProcessorError::transient("503")).is_transient());
        assert!(!HarvestError::from(ProcessorError::validation("bad url")).is_transient());
        assert!(!HarvestError::from(ProcessorError::permanent("404")).is_transient());
        assert!(HarvestError::storage("mem://a", "busy", true).is_transient());
        assert_eq!(
            HarvestError::storage("mem://a", "gone", false).kind(),
            ErrorKind::Infrastructure
        );
        assert_eq!(
            HarvestError::Validation("x".into()).kind(),
            ErrorKind::Permanent
        );
    }

    #[test]
    fn task_state_error_names_task_and_target() {
        let task_id = TaskId::from_uuid(Uuid::new_v4());
        let err = HarvestError::TaskState {
            task_id,
            from: TaskStatus::Completed,
            to: TaskStatus::Running,
        };
        let msg = err.to_string();
        assert!(msg.contains(&task_id.to_string()));
        assert!(msg.contains("running"));
        assert!(err.is_conflict());
    }

    #[test]
    fn storage_error_includes_path() {
        let err = HarvestError::storage("file://abc.bin", "disk full", false);
        assert!(err.to_string().contains("file://abc.bin"));
    }
}
