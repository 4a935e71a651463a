//! DataVolume (import job) generation.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::crd::{
    ANNOTATION_IMMEDIATE_BINDING, DataVolume, DataVolumeSource, DataVolumeSpec,
    DataVolumeStorage, StorageResources, VirtualDisk,
};
use crate::resources::common::{owner_reference, standard_labels};

/// Generate the import job filling the disk's claim.
///
/// The job shares the supplement name with the claim it populates.
pub fn generate_data_volume(
    disk: &VirtualDisk,
    name: &str,
    source: DataVolumeSource,
    size: &str,
    storage_class: Option<String>,
) -> DataVolume {
    let mut annotations = BTreeMap::new();
    if disk.wants_immediate_binding() {
        annotations.insert(ANNOTATION_IMMEDIATE_BINDING.to_string(), "true".to_string());
    }

    DataVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: disk.namespace(),
            labels: Some(standard_labels(disk)),
            annotations: (!annotations.is_empty()).then_some(annotations),
            owner_references: Some(vec![owner_reference(disk)]),
            ..Default::default()
        },
        spec: DataVolumeSpec {
            source,
            storage: DataVolumeStorage {
                storage_class_name: storage_class,
                resources: StorageResources {
                    requests: BTreeMap::from([("storage".to_string(), size.to_string())]),
                },
                ..Default::default()
            },
        },
        status: None,
    }
}
