//! Application layer: composes the ports into the running engine.
//!
//! - **EngineBuilder / Engine**: wiring and the operations surface
//! - **Scheduler**: pending → dispatch
//! - **Worker / WorkerGroup**: claim, attempt, retry, finalize
//! - **ReaperLoop**: requeues running tasks whose heartbeat expired

pub mod builder;
pub mod processors;
pub mod reaper_loop;
pub mod runtime;
pub mod scheduler;
pub mod status;
pub mod worker;
pub mod worker_loop;

pub use self::builder::{BuildError, EngineBuilder};
pub use self::processors::ProcessorTable;
pub use self::reaper_loop::{ABANDONED_MESSAGE, ReapReport, ReaperLoop};
pub use self::runtime::{Engine, EngineHandle};
pub use self::scheduler::{PassReport, Scheduler};
pub use self::status::{ExecutionReport, TaskReport};
pub use self::worker::{RunOutcome, Worker};
pub use self::worker_loop::{ChannelDispatcher, DispatchReceiver, WorkerGroup, dispatch_channel};
