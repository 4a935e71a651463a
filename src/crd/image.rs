//! Typed views of VirtualImage and ClusterVirtualImage.
//!
//! Images are both an upstream data source for disks and a consumer of
//! them (an image can be created from a disk).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A namespaced image.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "virtualization.vdisk.io",
    version = "v1alpha1",
    kind = "VirtualImage",
    plural = "virtualimages",
    shortname = "vi",
    status = "ImageStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualImageSpec {
    #[serde(default)]
    pub storage: ImageStorage,
    #[serde(default)]
    pub data_source: ImageDataSource,
}

/// A cluster-wide image.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "virtualization.vdisk.io",
    version = "v1alpha1",
    kind = "ClusterVirtualImage",
    plural = "clustervirtualimages",
    shortname = "cvi",
    status = "ImageStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVirtualImageSpec {
    #[serde(default)]
    pub data_source: ImageDataSource,
}

/// Where an image keeps its content.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ImageStorage {
    /// In the registry cache.
    #[default]
    ContainerRegistry,
    /// On a claim of its own.
    PersistentVolumeClaim,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageDataSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_ref: Option<ImageObjectRef>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageObjectRef {
    pub kind: String,
    pub name: String,
    /// Only set on cluster images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatus {
    #[serde(default)]
    pub phase: ImagePhase,
    #[serde(default)]
    pub size: ImageSize,
    #[serde(default)]
    pub target: ImageTarget,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ImagePhase {
    #[default]
    Pending,
    Provisioning,
    WaitForUserUpload,
    Ready,
    Failed,
    Lost,
    Terminating,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageSize {
    /// Size of the image content once unpacked (Kubernetes quantity).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unpacked: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageTarget {
    /// Location in the registry cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_url: Option<String>,
    /// Claim holding the image, for claim-backed images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<String>,
}

impl ImageStatus {
    pub fn is_ready(&self) -> bool {
        self.phase == ImagePhase::Ready
    }

    /// The image is still being built.
    pub fn is_in_creation(&self) -> bool {
        matches!(self.phase, ImagePhase::Pending | ImagePhase::Provisioning)
    }
}

impl ImageDataSource {
    /// The image is built from the given disk.
    pub fn references_disk(&self, namespace: Option<&str>, disk_name: &str) -> bool {
        self.object_ref.as_ref().is_some_and(|r| {
            r.kind == "VirtualDisk"
                && r.name == disk_name
                && (r.namespace.is_none() || r.namespace.as_deref() == namespace)
        })
    }
}
