//! Processor port - the scrape / OCR extraction collaborators.

use async_trait::async_trait;

use crate::domain::{ProcessorError, ProcessorOutput, TaskConfig};

/// Runs one attempt of a task.
///
/// Implementations classify their own failures: `Transient` is retried by the
/// worker, `Permanent` and `Validation` end the execution immediately.
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, config: &TaskConfig) -> Result<ProcessorOutput, ProcessorError>;
}
