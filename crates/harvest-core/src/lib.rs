//! harvest-core
//!
//! Task lifecycle engine for scrape and OCR automation.
//!
//! # Modules
//! - **domain**: records (task, execution, data object), state machine, metadata, retry policy, errors
//! - **ports**: DocumentStore, ArtifactStore, Processor, Dispatcher, Clock, IdGenerator
//! - **repository**: typed, revision-checked access to the three record collections
//! - **app**: worker, scheduler, reaper, engine builder and handle
//! - **impls**: in-memory and file adapters, HTTP scrape and tesseract OCR processors
//! - **config** / **observability**: layered configuration, logging setup, status counts

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod repository;

pub use app::{Engine, EngineBuilder, EngineHandle, RunOutcome};
pub use config::HarvestConfig;
pub use domain::{HarvestError, HarvestResult};
