//! Typed views of disk snapshots and the CSI VolumeSnapshot behind them.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A snapshot of a VirtualDisk.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "virtualization.vdisk.io",
    version = "v1alpha1",
    kind = "VirtualDiskSnapshot",
    plural = "virtualdisksnapshots",
    shortname = "vdsnapshot",
    status = "VirtualDiskSnapshotStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDiskSnapshotSpec {
    pub virtual_disk_name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDiskSnapshotStatus {
    #[serde(default)]
    pub phase: SnapshotPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_name: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum SnapshotPhase {
    #[default]
    Pending,
    InProgress,
    Ready,
    Failed,
    Terminating,
}

impl VirtualDiskSnapshot {
    pub fn phase(&self) -> SnapshotPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// The snapshot is still being taken.
    pub fn is_in_progress(&self) -> bool {
        matches!(self.phase(), SnapshotPhase::Pending | SnapshotPhase::InProgress)
    }
}

/// Annotations the snapshot controller copies from the source claim.
pub const ANNOTATION_STORAGE_CLASS: &str = "virtualization.vdisk.io/storage-class-name";
pub const ANNOTATION_VOLUME_MODE: &str = "virtualization.vdisk.io/volume-mode";
/// Comma-separated access modes.
pub const ANNOTATION_ACCESS_MODES: &str = "virtualization.vdisk.io/access-modes";

/// CSI VolumeSnapshot (snapshot.storage.k8s.io/v1).
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "snapshot.storage.k8s.io",
    version = "v1",
    kind = "VolumeSnapshot",
    plural = "volumesnapshots",
    status = "VolumeSnapshotStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSpec {
    #[serde(default)]
    pub source: VolumeSnapshotSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_size: Option<String>,
}

impl VolumeSnapshot {
    pub fn restore_size(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.restore_size.as_deref())
    }
}
