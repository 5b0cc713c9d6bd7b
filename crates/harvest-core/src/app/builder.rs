//! EngineBuilder: wires configuration and adapters into an `Engine`.
//!
//! Every adapter has a default picked from `HarvestConfig`; tests and
//! embedders override individual ones. The configuration is validated before
//! anything is opened, so a bad file fails fast with a readable message.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::processors::ProcessorTable;
use super::runtime::Engine;
use super::worker::Worker;
use crate::config::{HarvestConfig, StorageBackend, StoreBackend};
use crate::domain::{Decider, DefaultDecider, HarvestError};
use crate::impls::{
    FileDocumentStore, HttpScrapeProcessor, InMemoryArtifactStore, InMemoryDocumentStore,
    LocalArtifactStore, TesseractOcrProcessor,
};
use crate::ports::{ArtifactStore, Clock, DocumentStore, IdGenerator, Processor, SystemClock, UuidGenerator};
use crate::repository::Repositories;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid configuration: {0}")]
    Config(#[source] HarvestError),
    #[error("cannot open {what}: {source}")]
    Adapter {
        what: &'static str,
        #[source]
        source: HarvestError,
    },
}

pub struct EngineBuilder {
    config: HarvestConfig,
    documents: Option<Arc<dyn DocumentStore>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    scrape: Option<Arc<dyn Processor>>,
    ocr: Option<Arc<dyn Processor>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    decider: Option<Arc<dyn Decider>>,
}

impl EngineBuilder {
    pub fn new(config: HarvestConfig) -> Self {
        Self {
            config,
            documents: None,
            artifacts: None,
            scrape: None,
            ocr: None,
            clock: None,
            ids: None,
            decider: None,
        }
    }

    pub fn with_document_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(store);
        self
    }

    pub fn with_artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub fn with_scrape_processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.scrape = Some(processor);
        self
    }

    pub fn with_ocr_processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.ocr = Some(processor);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Replaces the `DefaultDecider` built from `config.retry`.
    pub fn with_decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub async fn build(self) -> Result<Engine, BuildError> {
        let config = self.config;
        config.validate().map_err(BuildError::Config)?;

        let documents = match self.documents {
            Some(store) => store,
            None => open_document_store(&config).await?,
        };
        let artifacts = match self.artifacts {
            Some(store) => store,
            None => open_artifact_store(&config).await?,
        };
        let scrape = match self.scrape {
            Some(processor) => processor,
            None => Arc::new(
                HttpScrapeProcessor::new(
                    Duration::from_secs(config.processors.http_timeout_secs),
                    &config.processors.user_agent,
                )
                .map_err(|source| BuildError::Adapter {
                    what: "http client",
                    source,
                })?,
            ),
        };
        let ocr = self.ocr.unwrap_or_else(|| {
            Arc::new(TesseractOcrProcessor::new(
                config.processors.tesseract_binary.clone(),
                config.processors.ocr_language.clone(),
            ))
        });
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self.ids.unwrap_or_else(|| Arc::new(UuidGenerator));
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(DefaultDecider::new(config.retry_policy())));

        let repos = Repositories::new(documents, Arc::clone(&clock), artifacts.scheme());
        let worker = Worker::new(
            repos.clone(),
            Arc::clone(&artifacts),
            ProcessorTable::new(scrape, ocr),
            decider,
            Arc::clone(&clock),
            Arc::clone(&ids),
        )
        .with_processor_timeout(config.processor_timeout())
        .with_max_attempts(config.retry.max_attempts);

        debug!(scheme = artifacts.scheme(), "engine wired");
        Ok(Engine::from_parts(config, repos, artifacts, Arc::new(worker), clock, ids))
    }
}

async fn open_document_store(config: &HarvestConfig) -> Result<Arc<dyn DocumentStore>, BuildError> {
    Ok(match config.store.backend {
        StoreBackend::Memory => Arc::new(InMemoryDocumentStore::new()),
        StoreBackend::File => Arc::new(
            FileDocumentStore::open(config.store.root.clone())
                .await
                .map_err(|source| BuildError::Adapter {
                    what: "record store",
                    source,
                })?,
        ),
    })
}

async fn open_artifact_store(config: &HarvestConfig) -> Result<Arc<dyn ArtifactStore>, BuildError> {
    Ok(match config.storage.backend {
        StorageBackend::Memory => Arc::new(InMemoryArtifactStore::new()),
        StorageBackend::Local => Arc::new(
            LocalArtifactStore::open(config.storage.root.clone())
                .await
                .map_err(|source| BuildError::Adapter {
                    what: "artifact storage",
                    source,
                })?,
        ),
    })
}
