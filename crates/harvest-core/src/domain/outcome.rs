//! Processor output: what a scrape or OCR run hands back to the worker.
//!
//! The worker stores every artifact, records a data object for it and links
//! it to the execution. `result` becomes the execution's `result`.

use super::metadata::RawMetadata;

/// One produced blob plus its (unvalidated) metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub metadata: RawMetadata,
}

impl Artifact {
    pub fn new(bytes: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
            metadata: RawMetadata::new(),
        }
    }

    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<super::metadata::RawValue>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorOutput {
    pub result: serde_json::Value,
    pub artifacts: Vec<Artifact>,
}

impl ProcessorOutput {
    pub fn new(result: serde_json::Value) -> Self {
        Self {
            result,
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::metadata::RawValue;

    #[test]
    fn builder_collects_artifacts_in_order() {
        let out = ProcessorOutput::new(serde_json::json!({"pages": 2}))
            .with_artifact(Artifact::new("a", "text/plain").with_metadata("page", 1u64))
            .with_artifact(Artifact::new("b", "text/plain").with_metadata("page", 2u64));

        assert_eq!(out.artifacts.len(), 2);
        assert_eq!(out.artifacts[0].bytes, b"a");
        assert_eq!(
            out.artifacts[1].metadata.get("page"),
            Some(&RawValue::from(2u64))
        );
    }
}
