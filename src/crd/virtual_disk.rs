//! VirtualDisk Custom Resource Definition.
//!
//! A VirtualDisk is a block device backed by a PersistentVolumeClaim. The
//! claim is filled from the declared data source (or left blank) and can be
//! moved to another storage class while a virtual machine keeps using it.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::conditions::Condition;

/// Finalizer held until the disk's provisioning resources are cleaned up.
pub const FINALIZER_CLEANUP: &str = "virtualization.vdisk.io/vd-cleanup";

/// Finalizer protecting a disk (and its claim) from deletion while in use.
pub const FINALIZER_PROTECTION: &str = "virtualization.vdisk.io/vd-protection";

/// Kubernetes' own claim protection finalizer.
pub const FINALIZER_PVC_PROTECTION: &str = "kubernetes.io/pvc-protection";

/// Claim annotation set while the claim's data is being exported.
pub const ANNOTATION_DATA_EXPORT_REQUEST: &str = "virtualization.vdisk.io/data-export-request";

/// Label marking a storage class as deprecated for new disks.
pub const LABEL_DEPRECATED_STORAGE_CLASS: &str = "virtualization.vdisk.io/deprecated";

/// Annotation marking a relocation operation as issued by volume migration.
pub const ANNOTATION_VOLUME_MIGRATION: &str = "virtualization.vdisk.io/volume-migration";

/// VirtualDisk is a custom resource describing a virtual machine disk.
///
/// Example:
/// ```yaml
/// apiVersion: virtualization.vdisk.io/v1alpha1
/// kind: VirtualDisk
/// metadata:
///   name: root
/// spec:
///   dataSource:
///     type: ObjectRef
///     objectRef:
///       kind: VirtualImage
///       name: ubuntu-24.04
///   persistentVolumeClaim:
///     size: 20Gi
///     storageClassName: replicated
/// ```
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "virtualization.vdisk.io",
    version = "v1alpha1",
    kind = "VirtualDisk",
    plural = "virtualdisks",
    shortname = "vd",
    status = "VirtualDiskStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Capacity", "type":"string", "jsonPath":".status.capacity"}"#,
    printcolumn = r#"{"name":"InUse", "type":"string", "jsonPath":".status.conditions[?(@.type=='InUse')].status"}"#,
    printcolumn = r#"{"name":"Progress", "type":"string", "jsonPath":".status.progress", "priority":1}"#,
    printcolumn = r#"{"name":"StorageClass", "type":"string", "jsonPath":".status.storageClassName", "priority":1}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDiskSpec {
    /// Where the disk content comes from. A disk without a data source is blank.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<DataSource>,

    /// Claim parameters for the underlying storage.
    #[serde(default)]
    pub persistent_volume_claim: DiskClaimSpec,

    /// Overrides how the import waits for a consumer on first-consumer
    /// storage classes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding_mode: Option<BindingMode>,
}

/// Declared data source of a disk.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    pub r#type: DataSourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<ContainerImageSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_ref: Option<ObjectRefSource>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum DataSourceType {
    #[serde(rename = "HTTP")]
    Http,
    ContainerImage,
    #[default]
    ObjectRef,
    Upload,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpSource {
    pub url: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerImageSource {
    /// Image reference, e.g. `registry.example.com/images/ubuntu:24.04`.
    pub image: String,
    /// Name of a docker-registry secret in the disk's namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secret: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRefSource {
    pub kind: ObjectRefKind,
    pub name: String,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ObjectRefKind {
    #[default]
    VirtualImage,
    ClusterVirtualImage,
    VirtualDiskSnapshot,
}

impl std::fmt::Display for ObjectRefKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectRefKind::VirtualImage => write!(f, "VirtualImage"),
            ObjectRefKind::ClusterVirtualImage => write!(f, "ClusterVirtualImage"),
            ObjectRefKind::VirtualDiskSnapshot => write!(f, "VirtualDiskSnapshot"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiskClaimSpec {
    /// Requested size (Kubernetes quantity). Optional for object references,
    /// where the image's unpacked size is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// Storage class for the claim. Changing it on a provisioned disk
    /// starts a storage class migration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum BindingMode {
    /// Import right away even on first-consumer storage classes.
    Immediate,
    /// Follow the storage class.
    WaitForFirstConsumer,
}

/// Status of a VirtualDisk.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDiskStatus {
    #[serde(default)]
    pub phase: DiskPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub target: DiskTarget,
    #[serde(default, skip_serializing_if = "MigrationState::is_empty")]
    pub migration_state: MigrationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<String>,
    /// Provisioning progress, e.g. "45%".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attached_to: Vec<AttachedVirtualMachine>,
    /// Storage class the current claim was provisioned on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "DiskStats::is_empty")]
    pub stats: DiskStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiskTarget {
    /// Name of the claim currently backing the disk.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub persistent_volume_claim: String,
}

/// A virtual machine that references the disk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AttachedVirtualMachine {
    pub name: String,
    /// The machine actively mounts the disk.
    #[serde(default)]
    pub mounted: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiskStats {
    /// Time from creation until the disk first became Ready, e.g. "42s".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_duration: Option<String>,
}

impl DiskStats {
    pub fn is_empty(&self) -> bool {
        self.creation_duration.is_none()
    }
}

/// Progress of a storage class migration.
///
/// A migration is in progress exactly when `start_timestamp` is set and
/// `end_timestamp` is not.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigrationState {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_pvc: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_pvc: String,
    /// RFC 3339 timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<String>,
    /// RFC 3339 timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<MigrationResult>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Storage class the migration was started for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_storage_class: Option<String>,
}

impl MigrationState {
    pub fn is_empty(&self) -> bool {
        *self == MigrationState::default()
    }

    pub fn is_in_progress(&self) -> bool {
        self.start_timestamp.is_some() && self.end_timestamp.is_none()
    }

    pub fn started_at(&self) -> Option<jiff::Timestamp> {
        self.start_timestamp.as_deref().and_then(parse_timestamp)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum MigrationResult {
    Succeeded,
    Failed,
}

/// Phase of a VirtualDisk.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum DiskPhase {
    /// Waiting for dependencies before provisioning starts.
    #[default]
    Pending,
    Provisioning,
    /// The claim waits for a virtual machine to be scheduled.
    WaitForFirstConsumer,
    /// The import waits for the user to upload the content.
    WaitForUserUpload,
    Resizing,
    Ready,
    Failed,
    /// The claim or its volume is gone.
    Lost,
    /// The claim's data is being exported.
    Exporting,
    Terminating,
}

impl std::fmt::Display for DiskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskPhase::Pending => write!(f, "Pending"),
            DiskPhase::Provisioning => write!(f, "Provisioning"),
            DiskPhase::WaitForFirstConsumer => write!(f, "WaitForFirstConsumer"),
            DiskPhase::WaitForUserUpload => write!(f, "WaitForUserUpload"),
            DiskPhase::Resizing => write!(f, "Resizing"),
            DiskPhase::Ready => write!(f, "Ready"),
            DiskPhase::Failed => write!(f, "Failed"),
            DiskPhase::Lost => write!(f, "Lost"),
            DiskPhase::Exporting => write!(f, "Exporting"),
            DiskPhase::Terminating => write!(f, "Terminating"),
        }
    }
}

/// Resolved data source variant of a disk.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DataSourceKind {
    Blank,
    Http,
    ContainerImage,
    Upload,
    ObjectRef,
}

impl VirtualDisk {
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn data_source_kind(&self) -> DataSourceKind {
        match &self.spec.data_source {
            None => DataSourceKind::Blank,
            Some(ds) => match ds.r#type {
                DataSourceType::Http => DataSourceKind::Http,
                DataSourceType::ContainerImage => DataSourceKind::ContainerImage,
                DataSourceType::Upload => DataSourceKind::Upload,
                DataSourceType::ObjectRef => DataSourceKind::ObjectRef,
            },
        }
    }

    /// Name shared by the supplement resources (claim and import job).
    pub fn supplement_name(&self) -> String {
        format!(
            "vd-{}-{}",
            self.name_any(),
            self.metadata.uid.as_deref().unwrap_or_default()
        )
    }

    /// Mutable status, created on first access.
    pub fn status_mut(&mut self) -> &mut VirtualDiskStatus {
        self.status.get_or_insert_with(VirtualDiskStatus::default)
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    pub fn phase(&self) -> DiskPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn migration_state(&self) -> Option<&MigrationState> {
        self.status.as_ref().map(|s| &s.migration_state)
    }

    pub fn is_migrating(&self) -> bool {
        self.migration_state()
            .is_some_and(MigrationState::is_in_progress)
    }

    /// The claim other handlers must follow.
    pub fn tracked_claim_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|s| s.target.persistent_volume_claim.as_str())
            .filter(|name| !name.is_empty())
    }

    /// The claim holding the provisioned data: the migration source while a
    /// migration is in progress, the tracked claim otherwise.
    pub fn provisioned_claim_name(&self) -> Option<&str> {
        match self.migration_state() {
            Some(state) if state.is_in_progress() && !state.source_pvc.is_empty() => {
                Some(state.source_pvc.as_str())
            }
            _ => self.tracked_claim_name(),
        }
    }

    pub fn declared_size(&self) -> Option<&str> {
        self.spec.persistent_volume_claim.size.as_deref()
    }

    pub fn declared_storage_class(&self) -> Option<&str> {
        self.spec
            .persistent_volume_claim
            .storage_class_name
            .as_deref()
            .filter(|name| !name.is_empty())
    }

    pub fn provisioned_storage_class(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.storage_class_name.as_deref())
            .filter(|name| !name.is_empty())
    }

    /// The declared storage class differs from the one the disk lives on.
    pub fn storage_class_changed(&self) -> bool {
        match (self.declared_storage_class(), self.provisioned_storage_class()) {
            (Some(declared), Some(provisioned)) => declared != provisioned,
            _ => false,
        }
    }

    pub fn wants_immediate_binding(&self) -> bool {
        self.spec.binding_mode == Some(BindingMode::Immediate)
    }
}

/// Parse an RFC 3339 timestamp as written into statuses.
pub fn parse_timestamp(value: &str) -> Option<jiff::Timestamp> {
    value.parse::<jiff::Timestamp>().ok()
}
