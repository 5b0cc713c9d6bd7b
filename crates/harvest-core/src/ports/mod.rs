//! Ports - the seams to everything outside the lifecycle core.
//!
//! Persistence (document store, artifact store), extraction (processors),
//! the worker pool hand-off, time and ID generation are traits here; the
//! implementations live in `impls`.

pub mod artifact_store;
pub mod clock;
pub mod dispatch;
pub mod document_store;
pub mod id_generator;
pub mod processor;

pub use self::artifact_store::ArtifactStore;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::dispatch::Dispatcher;
pub use self::document_store::{Document, DocumentStore};
pub use self::id_generator::{IdGenerator, UuidGenerator};
pub use self::processor::Processor;
