//! Domain identifiers (strongly-typed IDs).
//!
//! Every record is keyed by a UUID. `Id<T>` wraps the UUID together with a
//! zero-sized marker so a `TaskId` can never be passed where an
//! `ExecutionId` is expected.
//!
//! The textual form carries a short prefix (`task-…`, `exec-…`, `obj-…`);
//! parsing accepts the prefixed form or the bare UUID.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use uuid::Uuid;

use super::errors::HarvestError;

/// Marker trait implemented by each ID kind.
pub trait IdMarker: Send + Sync + 'static {
    /// Prefix used by `Display` (e.g. `"task-"`).
    fn prefix() -> &'static str;
}

/// Generic UUID-backed identifier.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    uuid: Uuid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self {
            uuid,
            _marker: PhantomData,
        }
    }

    pub fn as_uuid(&self) -> Uuid {
        self.uuid
    }
}

impl<T: IdMarker> From<Uuid> for Id<T> {
    fn from(uuid: Uuid) -> Self {
        Self::from_uuid(uuid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.uuid)
    }
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Uuid::parse_str(raw)
            .map(Self::from_uuid)
            .map_err(|e| HarvestError::Validation(format!("invalid id '{s}': {e}")))
    }
}

// ========================================
// Markers
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Execution {}

impl IdMarker for Execution {
    fn prefix() -> &'static str {
        "exec-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataObject {}

impl IdMarker for DataObject {
    fn prefix() -> &'static str {
        "obj-"
    }
}

/// Identifier of a Task (unit of requested work).
pub type TaskId = Id<Task>;

/// Identifier of an Execution (one run of a Task, possibly several attempts).
pub type ExecutionId = Id<Execution>;

/// Identifier of a Data Object (one stored artifact).
pub type DataObjectId = Id<DataObject>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        let u3 = Uuid::new_v4();

        let task = TaskId::from_uuid(u1);
        let exec = ExecutionId::from_uuid(u2);
        let obj = DataObjectId::from_uuid(u3);

        assert_eq!(task.as_uuid(), u1);
        assert_eq!(exec.as_uuid(), u2);
        assert_eq!(obj.as_uuid(), u3);

        assert!(task.to_string().starts_with("task-"));
        assert!(exec.to_string().starts_with("exec-"));
        assert!(obj.to_string().starts_with("obj-"));
        // let _: TaskId = exec; // <- does not compile
    }

    #[test]
    fn parses_prefixed_and_bare_forms() {
        let uuid = Uuid::new_v4();
        let id = TaskId::from_uuid(uuid);

        assert_eq!(id.to_string().parse::<TaskId>().unwrap(), id);
        assert_eq!(uuid.to_string().parse::<TaskId>().unwrap(), id);
        assert!("task-not-a-uuid".parse::<TaskId>().is_err());
    }

    #[test]
    fn serializes_as_plain_uuid_string() {
        let id = ExecutionId::from_uuid(Uuid::new_v4());
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(id.as_uuid().to_string()));

        let back: ExecutionId = serde_json::from_value(json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn marker_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<TaskId>(), size_of::<Uuid>());
        assert_eq!(size_of::<DataObjectId>(), 16);
    }
}
