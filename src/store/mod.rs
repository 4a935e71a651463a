//! Object store consumed by the reconciliation core.
//!
//! The core never talks to the API server directly; every read and write
//! goes through [`DiskStore`]. Lookups return `Ok(None)` for missing
//! objects, deletes tolerate "not found", and creates treat "already
//! exists" as success. A status write against a stale resource version
//! fails with [`Error::Conflict`](crate::controller::error::Error::Conflict).

mod kube_store;
mod memory;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

#[cfg(test)]
use mockall::automock;

use crate::controller::error::Result;
use crate::crd::{
    ClusterVirtualImage, DataVolume, VirtualDisk, VirtualDiskSnapshot, VirtualImage,
    VirtualMachine, VirtualMachineOperation, VolumeSnapshot,
};

/// Label KubeVirt puts on the launcher pods of a machine.
pub const LABEL_MACHINE_NAME: &str = "vm.kubevirt.io/name";

#[cfg_attr(test, automock)]
#[async_trait]
pub trait DiskStore: Send + Sync {
    // --- disks ---
    async fn get_disk(&self, namespace: &str, name: &str) -> Result<Option<VirtualDisk>>;
    /// Write the status sub-resource, guarded by the disk's resource version.
    ///
    /// Returns the resource version after the write, `None` when the disk is
    /// gone.
    async fn patch_disk_status(&self, disk: &VirtualDisk) -> Result<Option<String>>;
    /// Replace the finalizer list, guarded by `resource_version` when given.
    async fn patch_disk_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<()>;

    // --- storage claims ---
    async fn get_claim(&self, namespace: &str, name: &str)
    -> Result<Option<PersistentVolumeClaim>>;
    async fn list_claims(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>>;
    /// Create a claim, returning the stored object (with its generated name).
    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;
    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()>;
    async fn patch_claim_metadata(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
        owner_references: Vec<OwnerReference>,
    ) -> Result<()>;
    /// Set the claim's storage request.
    async fn patch_claim_size(&self, namespace: &str, name: &str, size: String) -> Result<()>;
    /// A non-terminated pod mounts the claim.
    async fn claim_mounted_by_pod(&self, namespace: &str, claim: &str) -> Result<bool>;

    // --- storage classes ---
    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>>;
    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>>;

    // --- import jobs ---
    async fn get_data_volume(&self, namespace: &str, name: &str) -> Result<Option<DataVolume>>;
    async fn create_data_volume(&self, data_volume: &DataVolume) -> Result<()>;
    async fn delete_data_volume(&self, namespace: &str, name: &str) -> Result<()>;

    // --- machines ---
    async fn get_virtual_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachine>>;
    async fn list_virtual_machines(&self, namespace: &str) -> Result<Vec<VirtualMachine>>;
    /// The machine has a running launcher pod, i.e. a relaunch is in flight.
    async fn machine_has_active_runtime(&self, namespace: &str, name: &str) -> Result<bool>;
    async fn list_operations(&self, namespace: &str) -> Result<Vec<VirtualMachineOperation>>;
    async fn create_operation(&self, operation: &VirtualMachineOperation) -> Result<()>;
    async fn delete_operation(&self, namespace: &str, name: &str) -> Result<()>;

    // --- images and snapshots ---
    async fn get_virtual_image(&self, namespace: &str, name: &str)
    -> Result<Option<VirtualImage>>;
    async fn list_virtual_images(&self, namespace: &str) -> Result<Vec<VirtualImage>>;
    async fn get_cluster_virtual_image(&self, name: &str) -> Result<Option<ClusterVirtualImage>>;
    async fn list_cluster_virtual_images(&self) -> Result<Vec<ClusterVirtualImage>>;
    async fn get_disk_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualDiskSnapshot>>;
    async fn list_disk_snapshots(&self, namespace: &str) -> Result<Vec<VirtualDiskSnapshot>>;
    async fn get_volume_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VolumeSnapshot>>;

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool>;
}
