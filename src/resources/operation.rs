//! VirtualMachineOperation generation for volume migration.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::crd::{
    ANNOTATION_VOLUME_MIGRATION, OperationType, VirtualMachineOperation,
    VirtualMachineOperationSpec,
};

/// Prefix of generated relocation operation names.
pub const VOLUME_MIGRATION_PREFIX: &str = "volume-migration-";

/// Generate an Evict operation relocating `machine` together with its disks.
pub fn generate_volume_migration(namespace: &str, machine: &str) -> VirtualMachineOperation {
    VirtualMachineOperation {
        metadata: ObjectMeta {
            generate_name: Some(VOLUME_MIGRATION_PREFIX.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: Some(BTreeMap::from([(
                ANNOTATION_VOLUME_MIGRATION.to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        },
        spec: VirtualMachineOperationSpec {
            r#type: OperationType::Evict,
            virtual_machine_name: machine.to_string(),
        },
        status: None,
    }
}

/// The operation was issued by volume migration.
pub fn is_volume_migration(operation: &VirtualMachineOperation) -> bool {
    operation
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_VOLUME_MIGRATION))
        .is_some_and(|v| v == "true")
}
