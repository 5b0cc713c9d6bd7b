//! Data object record: one stored artifact produced by an execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{HarvestError, HarvestResult};
use super::ids::{DataObjectId, ExecutionId};
use super::metadata::Metadata;

/// Immutable once created. There is no update path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataObjectRecord {
    id: DataObjectId,
    execution_id: ExecutionId,
    storage_path: String,
    content_type: String,
    #[serde(default)]
    metadata: Metadata,
    created_at: DateTime<Utc>,
}

impl DataObjectRecord {
    /// `scheme` is the configured artifact store's scheme (`mem`, `file`).
    pub fn new(
        id: DataObjectId,
        execution_id: ExecutionId,
        storage_path: impl Into<String>,
        content_type: impl Into<String>,
        metadata: Metadata,
        scheme: &str,
        now: DateTime<Utc>,
    ) -> HarvestResult<Self> {
        let record = Self {
            id,
            execution_id,
            storage_path: storage_path.into(),
            content_type: content_type.into(),
            metadata,
            created_at: now,
        };
        record.validate(scheme)?;
        Ok(record)
    }

    pub fn id(&self) -> DataObjectId {
        self.id
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn storage_path(&self) -> &str {
        &self.storage_path
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn validate(&self, scheme: &str) -> HarvestResult<()> {
        validate_storage_path(&self.storage_path, scheme)?;
        validate_content_type(&self.content_type)
    }
}

/// `<scheme>://seg/seg/...` with no empty, `.` or `..` segments.
pub fn validate_storage_path(path: &str, scheme: &str) -> HarvestResult<()> {
    let prefix = format!("{scheme}://");
    let Some(rest) = path.strip_prefix(&prefix) else {
        return Err(HarvestError::Validation(format!(
            "storage path '{path}' does not belong to the '{scheme}' backend"
        )));
    };
    if rest.is_empty() {
        return Err(HarvestError::Validation(format!(
            "storage path '{path}' has no object key"
        )));
    }
    if let Some(bad) = rest
        .split('/')
        .find(|seg| seg.is_empty() || *seg == "." || *seg == "..")
    {
        return Err(HarvestError::Validation(format!(
            "storage path '{path}' contains an invalid segment '{bad}'"
        )));
    }
    Ok(())
}

/// MIME `type/subtype`, parameters allowed after `;`.
pub fn validate_content_type(content_type: &str) -> HarvestResult<()> {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    let valid = match essence.split_once('/') {
        Some((ty, sub)) => {
            let token = |s: &str| {
                !s.is_empty()
                    && s.chars()
                        .all(|c| c.is_ascii_alphanumeric() || "!#$&-^_.+".contains(c))
            };
            token(ty) && token(sub)
        }
        None => false,
    };
    if !valid {
        return Err(HarvestError::Validation(format!(
            "'{content_type}' is not a MIME type"
        )));
    }
    Ok(())
}
