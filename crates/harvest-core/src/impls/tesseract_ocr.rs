//! TesseractOcrProcessor - runs the `tesseract` CLI on a local image.
//!
//! `tesseract <file> stdout -l <language>`; the recognized text becomes one
//! `text/plain` artifact.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tracing::debug;

use crate::domain::task::is_ocr_language;
use crate::domain::{Artifact, ProcessorError, ProcessorOutput, TaskConfig};
use crate::ports::Processor;

pub struct TesseractOcrProcessor {
    binary: String,
    default_language: String,
}

impl TesseractOcrProcessor {
    pub fn new(binary: impl Into<String>, default_language: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            default_language: default_language.into(),
        }
    }

    fn language<'a>(&'a self, config: &'a TaskConfig) -> &'a str {
        config
            .param("language")
            .and_then(|l| l.as_str())
            .unwrap_or(&self.default_language)
    }
}

/// `file:///x/y.png` or a plain path. Relative paths that start with `-`
/// get a `./` prefix so tesseract never reads them as options.
fn source_path(source: &str) -> PathBuf {
    let source = source.trim();
    let path = source.strip_prefix("file://").unwrap_or(source);
    if path.starts_with('-') {
        Path::new(".").join(path)
    } else {
        PathBuf::from(path)
    }
}

#[async_trait]
impl Processor for TesseractOcrProcessor {
    fn name(&self) -> &'static str {
        "tesseract-ocr"
    }

    async fn run(&self, config: &TaskConfig) -> Result<ProcessorOutput, ProcessorError> {
        let path = source_path(&config.source);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                return Err(ProcessorError::validation(format!(
                    "source {} is not a regular file",
                    path.display()
                )));
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                return Err(ProcessorError::validation(format!(
                    "source file {} does not exist",
                    path.display()
                )));
            }
            Err(e) => {
                return Err(ProcessorError::transient(format!(
                    "cannot stat {}: {e}",
                    path.display()
                )));
            }
        }

        let language = self.language(config);
        if !is_ocr_language(language) {
            return Err(ProcessorError::validation(format!(
                "'{language}' is not a tesseract language"
            )));
        }
        let started = Instant::now();
        debug!(binary = %self.binary, path = %path.display(), language, "running tesseract");

        let output = Command::new(&self.binary)
            .arg(&path)
            .arg("stdout")
            .arg("-l")
            .arg(language)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                IoErrorKind::NotFound => {
                    ProcessorError::permanent(format!("'{}' is not installed", self.binary))
                }
                _ => ProcessorError::transient(format!("failed to spawn '{}': {e}", self.binary)),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProcessorError::permanent(format!(
                "tesseract exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        let characters = text.chars().count() as u64;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let source = path.display().to_string();

        let artifact = Artifact::new(text.into_bytes(), "text/plain; charset=utf-8")
            .with_metadata("source", source.clone())
            .with_metadata("language", language)
            .with_metadata("characters", characters)
            .with_metadata("elapsed_ms", elapsed_ms);

        Ok(ProcessorOutput::new(json!({
            "source": source,
            "language": language,
            "characters": characters,
        }))
        .with_artifact(artifact))
    }
}
