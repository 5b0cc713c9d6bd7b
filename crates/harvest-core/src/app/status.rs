//! Status views: a task with its executions and their data objects.

use serde::Serialize;

use crate::domain::{DataObjectRecord, ExecutionRecord, TaskRecord};

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task: TaskRecord,
    pub executions: Vec<ExecutionReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub execution: ExecutionRecord,
    pub objects: Vec<DataObjectRecord>,
}

impl TaskReport {
    /// The most recent execution, if the task ever ran.
    pub fn latest(&self) -> Option<&ExecutionReport> {
        self.executions.last()
    }

    /// One line for logs and the CLI.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} {} {}",
            self.task.id(),
            self.task.task_type(),
            self.task.status()
        );
        if let Some(latest) = self.latest() {
            let exec = &latest.execution;
            line.push_str(&format!(
                " ({} executions, last {} after {}/{} attempts, {} objects)",
                self.executions.len(),
                exec.status,
                exec.attempts,
                exec.max_attempts,
                latest.objects.len()
            ));
            if let Some(message) = &exec.error_message {
                line.push_str(&format!(": {message}"));
            }
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionId, TaskConfig, TaskId, TaskType};
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn summary_mentions_the_latest_failure() {
        let task = TaskRecord::new(
            TaskId::from_uuid(Uuid::new_v4()),
            TaskType::Ocr,
            TaskConfig::new("scan.png"),
            Utc::now(),
            None,
        )
        .unwrap();
        let mut exec =
            ExecutionRecord::start(ExecutionId::from_uuid(Uuid::new_v4()), task.id(), 3, Utc::now())
                .unwrap();
        exec.begin_attempt().unwrap();
        exec.fail("attempt 1/3: bad language", Utc::now()).unwrap();

        let report = TaskReport {
            task,
            executions: vec![ExecutionReport {
                execution: exec,
                objects: Vec::new(),
            }],
        };
        let summary = report.summary();
        assert!(summary.contains("1 executions, last failed after 1/3 attempts"));
        assert!(summary.ends_with(": attempt 1/3: bad language"));
    }

    #[test]
    fn summary_of_a_task_that_never_ran() {
        let task = TaskRecord::new(
            TaskId::from_uuid(Uuid::new_v4()),
            TaskType::Scrape,
            TaskConfig::new("https://example.com"),
            Utc::now(),
            None,
        )
        .unwrap();
        let report = TaskReport {
            task,
            executions: Vec::new(),
        };
        assert!(report.summary().ends_with("scrape pending"));
    }
}
