//! Fixed mapping from task type to processor.

use std::sync::Arc;

use crate::domain::TaskType;
use crate::ports::Processor;

/// One processor per task type. Adding a `TaskType` variant fails to compile
/// until it gets a slot here.
#[derive(Clone)]
pub struct ProcessorTable {
    pub scrape: Arc<dyn Processor>,
    pub ocr: Arc<dyn Processor>,
}

impl ProcessorTable {
    pub fn new(scrape: Arc<dyn Processor>, ocr: Arc<dyn Processor>) -> Self {
        Self { scrape, ocr }
    }

    pub fn for_type(&self, task_type: TaskType) -> &Arc<dyn Processor> {
        match task_type {
            TaskType::Scrape => &self.scrape,
            TaskType::Ocr => &self.ocr,
        }
    }
}
