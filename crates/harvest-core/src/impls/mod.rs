//! Impls - adapters behind the ports.
//!
//! - In-memory document/artifact stores (tests and the `memory` backends)
//! - File-backed document store and local artifact store
//! - reqwest scrape processor and tesseract OCR processor

pub mod file_document;
pub mod http_scrape;
pub mod inmem_artifact;
pub mod inmem_document;
pub mod local_artifact;
pub mod tesseract_ocr;

pub use self::file_document::FileDocumentStore;
pub use self::http_scrape::HttpScrapeProcessor;
pub use self::inmem_artifact::InMemoryArtifactStore;
pub use self::inmem_document::InMemoryDocumentStore;
pub use self::local_artifact::LocalArtifactStore;
pub use self::tesseract_ocr::TesseractOcrProcessor;
