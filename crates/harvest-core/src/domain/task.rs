//! Task record: the unit of requested work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::{HarvestError, HarvestResult};
use super::ids::{ExecutionId, TaskId};
use super::state::TaskStatus;

/// Tesseract language spec such as `eng`, `chi_sim` or `eng+deu`. It is
/// passed as a command-line argument, so a leading `-` is refused.
pub fn is_ocr_language(language: &str) -> bool {
    !language.is_empty()
        && !language.starts_with('-')
        && language
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '-' | '/'))
}

/// The closed set of work kinds. Each maps to exactly one processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Scrape,
    Ocr,
}

impl TaskType {
    pub const ALL: [TaskType; 2] = [TaskType::Scrape, TaskType::Ocr];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Scrape => "scrape",
            TaskType::Ocr => "ocr",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| HarvestError::Validation(format!("unknown task type '{s}'")))
    }
}

/// Source identifier plus type-specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub source: String,

    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

impl TaskConfig {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            parameters: serde_json::Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.parameters.get(key)
    }

    /// Check the configuration against the rules of `task_type`.
    ///
    /// - scrape: `source` is an absolute http(s) URL; `depth` (if given) is a
    ///   non-negative integer.
    /// - ocr: `source` is a non-empty path or `file://` URL; `language` (if
    ///   given) is a language spec such as `eng+deu`.
    pub fn validate(&self, task_type: TaskType) -> HarvestResult<()> {
        let source = self.source.trim();
        if source.is_empty() {
            return Err(HarvestError::Validation("source must not be empty".into()));
        }

        match task_type {
            TaskType::Scrape => {
                let url = url::Url::parse(source).map_err(|e| {
                    HarvestError::Validation(format!("scrape source '{source}' is not a URL: {e}"))
                })?;
                if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
                    return Err(HarvestError::Validation(format!(
                        "scrape source '{source}' must be an http(s) URL with a host"
                    )));
                }
                if let Some(depth) = self.param("depth")
                    && depth.as_u64().is_none()
                {
                    return Err(HarvestError::Validation(format!(
                        "depth must be a non-negative integer, got {depth}"
                    )));
                }
            }
            TaskType::Ocr => {
                if source.starts_with("http://") || source.starts_with("https://") {
                    return Err(HarvestError::Validation(format!(
                        "ocr source '{source}' must be a local file"
                    )));
                }
                if let Some(language) = self.param("language")
                    && !language.as_str().is_some_and(is_ocr_language)
                {
                    return Err(HarvestError::Validation(format!(
                        "language must be a tesseract language such as \"eng+deu\", got {language}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Task record as persisted in the document store.
///
/// Fields are private: status only moves through `transition` (or the
/// crate-internal `requeue` used by the reaper), and `execution_history`
/// only grows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    id: TaskId,
    task_type: TaskType,
    config: TaskConfig,
    status: TaskStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,

    /// Not-before constraint while pending; actual dispatch time afterwards.
    scheduled_at: Option<DateTime<Utc>>,

    #[serde(default)]
    execution_history: Vec<ExecutionId>,
}

impl TaskRecord {
    /// Create a new pending task. Fails if the configuration is invalid.
    pub fn new(
        id: TaskId,
        task_type: TaskType,
        config: TaskConfig,
        now: DateTime<Utc>,
        not_before: Option<DateTime<Utc>>,
    ) -> HarvestResult<Self> {
        config.validate(task_type)?;
        Ok(Self {
            id,
            task_type,
            config,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            scheduled_at: not_before,
            execution_history: Vec::new(),
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.scheduled_at
    }

    pub fn execution_history(&self) -> &[ExecutionId] {
        &self.execution_history
    }

    /// Record-level invariants checked before every write.
    pub fn validate(&self) -> HarvestResult<()> {
        self.config.validate(self.task_type)?;
        if self.updated_at < self.created_at {
            return Err(HarvestError::Validation(format!(
                "task {}: updated_at precedes created_at",
                self.id
            )));
        }
        let mut seen = std::collections::HashSet::new();
        if !self.execution_history.iter().all(|id| seen.insert(*id)) {
            return Err(HarvestError::Validation(format!(
                "task {}: duplicate entry in execution_history",
                self.id
            )));
        }
        Ok(())
    }

    /// Pending with no unmet `scheduled_at` constraint.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status.is_runnable() && self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// Move along the state graph. Entering `Running` stamps `scheduled_at`.
    pub fn transition(&mut self, to: TaskStatus, now: DateTime<Utc>) -> HarvestResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(HarvestError::TaskState {
                task_id: self.id,
                from: self.status,
                to,
            });
        }
        if to == TaskStatus::Running {
            self.scheduled_at = Some(now);
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Append an execution to the history. Returns false if already present.
    pub fn record_execution(&mut self, execution_id: ExecutionId, now: DateTime<Utc>) -> bool {
        if self.execution_history.contains(&execution_id) {
            return false;
        }
        self.execution_history.push(execution_id);
        self.updated_at = now;
        true
    }

    /// Worker heartbeat.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    /// Recovery edge used only by the reaper: running -> pending.
    pub(crate) fn requeue(&mut self, now: DateTime<Utc>) -> HarvestResult<()> {
        if self.status != TaskStatus::Running {
            return Err(HarvestError::TaskState {
                task_id: self.id,
                from: self.status,
                to: TaskStatus::Pending,
            });
        }
        self.status = TaskStatus::Pending;
        self.scheduled_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// `other` keeps this record's history as a prefix (history only grows).
    pub(crate) fn history_extends(&self, other: &TaskRecord) -> bool {
        other.execution_history.starts_with(&self.execution_history)
    }
}
