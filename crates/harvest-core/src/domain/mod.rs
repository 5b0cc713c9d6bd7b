//! Domain model (IDs, statuses, records, metadata, retry decisions, errors).
//!
//! Nothing in here performs I/O. Records enforce their own invariants; the
//! repositories call `validate` before every write.

pub mod data_object;
pub mod decision;
pub mod errors;
pub mod execution;
pub mod ids;
pub mod metadata;
pub mod outcome;
pub mod retry;
pub mod state;
pub mod task;

pub use data_object::DataObjectRecord;
pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{ErrorKind, HarvestError, HarvestResult, ProcessorError, ProcessorErrorKind};
pub use execution::ExecutionRecord;
pub use ids::{DataObjectId, ExecutionId, Id, IdMarker, TaskId};
pub use metadata::{Metadata, MetadataValue, RawMetadata, RawValue};
pub use outcome::{Artifact, ProcessorOutput};
pub use retry::RetryPolicy;
pub use state::{ExecutionStatus, TaskStatus};
pub use task::{TaskConfig, TaskRecord, TaskType};
