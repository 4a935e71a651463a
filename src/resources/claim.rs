//! PersistentVolumeClaim generation for VirtualDisks.
//!
//! Three flavours are created: the blank claim of a disk without a data
//! source, the claim restored from a volume snapshot, and the migration
//! target on another storage class.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, TypedLocalObjectReference,
    TypedObjectReference, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::crd::VirtualDisk;
use crate::resources::common::{owner_reference, standard_labels};

/// Access mode used when nothing else is known.
pub const DEFAULT_ACCESS_MODE: &str = "ReadWriteOnce";

/// Access mode that lets a machine relocate without moving its storage.
pub const ACCESS_MODE_RWX: &str = "ReadWriteMany";

/// Shape of a claim to create.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClaimParams {
    pub size: String,
    pub storage_class: Option<String>,
    pub access_modes: Vec<String>,
    pub volume_mode: Option<String>,
}

fn claim_spec(params: &ClaimParams) -> PersistentVolumeClaimSpec {
    let access_modes = if params.access_modes.is_empty() {
        vec![DEFAULT_ACCESS_MODE.to_string()]
    } else {
        params.access_modes.clone()
    };

    PersistentVolumeClaimSpec {
        access_modes: Some(access_modes),
        storage_class_name: params.storage_class.clone(),
        volume_mode: params.volume_mode.clone(),
        resources: Some(VolumeResourceRequirements {
            requests: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity(params.size.clone()),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn claim_metadata(disk: &VirtualDisk) -> ObjectMeta {
    ObjectMeta {
        namespace: disk.namespace(),
        labels: Some(standard_labels(disk)),
        owner_references: Some(vec![owner_reference(disk)]),
        ..Default::default()
    }
}

/// Generate the empty claim backing a blank disk.
pub fn generate_blank_claim(disk: &VirtualDisk, name: &str, params: &ClaimParams) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..claim_metadata(disk)
        },
        spec: Some(claim_spec(params)),
        ..Default::default()
    }
}

/// Generate a claim restored from a CSI volume snapshot.
pub fn generate_snapshot_claim(
    disk: &VirtualDisk,
    name: &str,
    volume_snapshot: &str,
    params: &ClaimParams,
) -> PersistentVolumeClaim {
    let mut spec = claim_spec(params);
    spec.data_source = Some(TypedLocalObjectReference {
        api_group: Some("snapshot.storage.k8s.io".to_string()),
        kind: "VolumeSnapshot".to_string(),
        name: volume_snapshot.to_string(),
    });
    spec.data_source_ref = Some(TypedObjectReference {
        api_group: Some("snapshot.storage.k8s.io".to_string()),
        kind: "VolumeSnapshot".to_string(),
        name: volume_snapshot.to_string(),
        namespace: None,
    });

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..claim_metadata(disk)
        },
        spec: Some(spec),
        ..Default::default()
    }
}

/// Generate the migration target claim.
///
/// The name is left to the API server (`generateName`); the owner
/// reference is how a later pass rediscovers the claim.
pub fn generate_migration_target(disk: &VirtualDisk, params: &ClaimParams) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            generate_name: Some(format!("vd-{}-", disk.name_any())),
            ..claim_metadata(disk)
        },
        spec: Some(claim_spec(params)),
        ..Default::default()
    }
}

// ============================================================================
// Claim inspection
// ============================================================================

pub fn claim_phase(claim: &PersistentVolumeClaim) -> &str {
    claim
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("")
}

pub fn is_bound(claim: &PersistentVolumeClaim) -> bool {
    claim_phase(claim) == "Bound"
}

pub fn is_lost(claim: &PersistentVolumeClaim) -> bool {
    claim_phase(claim) == "Lost"
}

pub fn is_pending(claim: &PersistentVolumeClaim) -> bool {
    matches!(claim_phase(claim), "Pending" | "")
}

pub fn is_terminating(claim: &PersistentVolumeClaim) -> bool {
    claim.metadata.deletion_timestamp.is_some()
}

/// Actual size of a bound claim.
pub fn capacity(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get("storage"))
        .map(|q| q.0.as_str())
}

/// Requested size of a claim.
pub fn requested_size(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .map(|q| q.0.as_str())
}

pub fn storage_class(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.storage_class_name.as_deref())
}

pub fn access_modes(claim: &PersistentVolumeClaim) -> Vec<String> {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.access_modes.clone())
        .unwrap_or_default()
}

pub fn volume_mode(claim: &PersistentVolumeClaim) -> Option<String> {
    claim.spec.as_ref().and_then(|s| s.volume_mode.clone())
}
