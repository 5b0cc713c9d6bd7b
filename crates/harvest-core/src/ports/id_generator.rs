//! IdGenerator port - ID generation.
//!
//! Records are keyed by UUID v4. The trait exists so tests can hand out
//! predictable IDs.

use uuid::Uuid;

use crate::domain::ids::{DataObjectId, ExecutionId, TaskId};

pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_execution_id(&self) -> ExecutionId;

    fn generate_data_object_id(&self) -> DataObjectId;
}

/// Random UUID v4 generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from_uuid(Uuid::new_v4())
    }

    fn generate_execution_id(&self) -> ExecutionId {
        ExecutionId::from_uuid(Uuid::new_v4())
    }

    fn generate_data_object_id(&self) -> DataObjectId {
        DataObjectId::from_uuid(Uuid::new_v4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_generator_generates_unique_v4_ids() {
        let id_gen = UuidGenerator;

        let id1 = id_gen.generate_task_id();
        let id2 = id_gen.generate_task_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.as_uuid().get_version_num(), 4);

        // Display prefixes differ per kind.
        assert!(id_gen.generate_execution_id().to_string().starts_with("exec-"));
        assert!(id_gen.generate_data_object_id().to_string().starts_with("obj-"));
    }
}
