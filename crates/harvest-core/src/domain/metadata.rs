//! Data object metadata.
//!
//! Processors hand back `RawMetadata`, which may contain anything a
//! collaborator can produce (including raw bytes). `Metadata` is the validated
//! form: strings, numbers, booleans, timestamps, maps of those (recursively),
//! and lists whose elements are scalars or maps.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::errors::{HarvestError, HarvestResult};

const MAX_DEPTH: usize = 16;

/// Unvalidated metadata value as produced by a collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Timestamp(DateTime<Utc>),
    Bytes(Vec<u8>),
    List(Vec<RawValue>),
    Map(BTreeMap<String, RawValue>),
}

pub type RawMetadata = BTreeMap<String, RawValue>;

impl From<serde_json::Value> for RawValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => RawValue::Null,
            serde_json::Value::Bool(b) => RawValue::Bool(b),
            serde_json::Value::Number(n) => RawValue::Number(n),
            serde_json::Value::String(s) => RawValue::String(s),
            serde_json::Value::Array(items) => {
                RawValue::List(items.into_iter().map(RawValue::from).collect())
            }
            serde_json::Value::Object(map) => RawValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, RawValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::String(value.to_string())
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        RawValue::String(value)
    }
}

impl From<bool> for RawValue {
    fn from(value: bool) -> Self {
        RawValue::Bool(value)
    }
}

impl From<u64> for RawValue {
    fn from(value: u64) -> Self {
        RawValue::Number(value.into())
    }
}

impl From<i64> for RawValue {
    fn from(value: i64) -> Self {
        RawValue::Number(value.into())
    }
}

impl From<DateTime<Utc>> for RawValue {
    fn from(value: DateTime<Utc>) -> Self {
        RawValue::Timestamp(value)
    }
}

/// A validated, serializable metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MetadataValue {
    String(String),
    Number(serde_json::Number),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Map(BTreeMap<String, MetadataValue>),
    List(Vec<MetadataValue>),
}

/// Validated metadata attached to a data object.
///
/// Deserializing runs the same checks as `TryFrom<RawMetadata>`, so a
/// stored record cannot smuggle in shapes a processor could not.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, MetadataValue>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetadataValue)> {
        self.0.iter()
    }
}

impl TryFrom<RawMetadata> for Metadata {
    type Error = HarvestError;

    fn try_from(raw: RawMetadata) -> HarvestResult<Self> {
        validate_map(raw, "metadata", 0).map(Metadata)
    }
}

impl From<MetadataValue> for RawValue {
    fn from(value: MetadataValue) -> Self {
        match value {
            MetadataValue::String(s) => RawValue::String(s),
            MetadataValue::Number(n) => RawValue::Number(n),
            MetadataValue::Bool(b) => RawValue::Bool(b),
            MetadataValue::Timestamp(t) => RawValue::Timestamp(t),
            MetadataValue::Map(map) => {
                RawValue::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
            MetadataValue::List(items) => {
                RawValue::List(items.into_iter().map(RawValue::from).collect())
            }
        }
    }
}

impl<'de> Deserialize<'de> for Metadata {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = BTreeMap::<String, MetadataValue>::deserialize(deserializer)?;
        let raw: RawMetadata = map.into_iter().map(|(k, v)| (k, v.into())).collect();
        Metadata::try_from(raw).map_err(serde::de::Error::custom)
    }
}

fn validate_map(
    raw: BTreeMap<String, RawValue>,
    path: &str,
    depth: usize,
) -> HarvestResult<BTreeMap<String, MetadataValue>> {
    if depth > MAX_DEPTH {
        return Err(HarvestError::Validation(format!(
            "{path}: nesting deeper than {MAX_DEPTH} levels"
        )));
    }
    raw.into_iter()
        .map(|(key, value)| {
            if key.trim().is_empty() {
                return Err(HarvestError::Validation(format!("{path}: empty key")));
            }
            let child = format!("{path}.{key}");
            let value = validate_value(value, &child, depth, true)?;
            Ok((key, value))
        })
        .collect()
}

fn validate_value(
    value: RawValue,
    path: &str,
    depth: usize,
    allow_list: bool,
) -> HarvestResult<MetadataValue> {
    match value {
        RawValue::Bool(b) => Ok(MetadataValue::Bool(b)),
        RawValue::Number(n) => Ok(MetadataValue::Number(n)),
        RawValue::String(s) => Ok(MetadataValue::String(s)),
        RawValue::Timestamp(t) => Ok(MetadataValue::Timestamp(t)),
        RawValue::Map(map) => validate_map(map, path, depth + 1).map(MetadataValue::Map),
        RawValue::List(items) if allow_list => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| validate_value(item, &format!("{path}[{i}]"), depth + 1, false))
            .collect::<HarvestResult<Vec<_>>>()
            .map(MetadataValue::List),
        RawValue::List(_) => Err(HarvestError::Validation(format!(
            "{path}: nested lists are not allowed"
        ))),
        RawValue::Bytes(bytes) => Err(HarvestError::Validation(format!(
            "{path}: binary value ({} bytes) is not serializable",
            bytes.len()
        ))),
        RawValue::Null => Err(HarvestError::Validation(format!(
            "{path}: null is not an allowed metadata value"
        ))),
    }
}
