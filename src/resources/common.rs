//! Common resource generation utilities.
//!
//! Labels and owner references shared by every object created on behalf of
//! a VirtualDisk.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use crate::crd::VirtualDisk;

/// Name of the operator in `app.kubernetes.io/managed-by`.
pub const MANAGED_BY: &str = "vdisk-operator";

/// Label carrying the name of the owning disk.
pub const LABEL_DISK_NAME: &str = "virtualization.vdisk.io/virtual-disk";

/// Standard labels applied to all managed resources
pub fn standard_labels(disk: &VirtualDisk) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        MANAGED_BY.to_string(),
    );
    labels.insert(
        "app.kubernetes.io/component".to_string(),
        "virtual-disk".to_string(),
    );
    labels.insert(LABEL_DISK_NAME.to_string(), disk.name_any());
    labels
}

/// Controller owner reference pointing at a disk.
pub fn owner_reference(disk: &VirtualDisk) -> OwnerReference {
    OwnerReference {
        api_version: VirtualDisk::api_version(&()).to_string(),
        kind: VirtualDisk::kind(&()).to_string(),
        name: disk.name_any(),
        uid: disk.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// The object lists `owner` among its owner references.
pub fn is_owned_by(owner_refs: &[OwnerReference], owner: &VirtualDisk) -> bool {
    let uid = owner.uid().unwrap_or_default();
    owner_refs
        .iter()
        .any(|r| r.kind == VirtualDisk::kind(&()) && r.uid == uid)
}
