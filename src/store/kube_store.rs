//! [`DiskStore`] backed by the Kubernetes API.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use super::{DiskStore, LABEL_MACHINE_NAME};
use crate::controller::error::{Error, Result};
use crate::crd::{
    ClusterVirtualImage, DataVolume, VirtualDisk, VirtualDiskSnapshot, VirtualImage,
    VirtualMachine, VirtualMachineOperation, VolumeSnapshot,
};

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "vdisk-operator";

/// Store talking to the API server through a kube client.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Merge patches attributed to the operator.
fn merge_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn api_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(e) => Some(e.code),
        _ => None,
    }
}

fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409 && e.reason == "AlreadyExists")
}

/// Delete an object, treating "not found" as success.
async fn delete_tolerant<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(()),
        Err(e) if api_code(&e) == Some(404) => {
            debug!(name = %name, "Object already gone");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Patch an object, treating "not found" as success.
async fn patch_tolerant<K>(api: &Api<K>, name: &str, patch: serde_json::Value) -> Result<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api
        .patch(name, &merge_params(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if api_code(&e) == Some(404) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl DiskStore for KubeStore {
    async fn get_disk(&self, namespace: &str, name: &str) -> Result<Option<VirtualDisk>> {
        Ok(self.namespaced::<VirtualDisk>(namespace).get_opt(name).await?)
    }

    async fn patch_disk_status(&self, disk: &VirtualDisk) -> Result<Option<String>> {
        let namespace = disk.namespace().unwrap_or_default();
        let name = disk.name_any();
        let api = self.namespaced::<VirtualDisk>(&namespace);
        let patch = json!({
            "metadata": { "resourceVersion": disk.resource_version() },
            "status": disk.status,
        });
        match api
            .patch_status(&name, &merge_params(), &Patch::Merge(&patch))
            .await
        {
            Ok(stored) => Ok(stored.resource_version()),
            Err(e) if api_code(&e) == Some(404) => Ok(None),
            Err(e) if api_code(&e) == Some(409) => Err(Error::Conflict(format!(
                "VirtualDisk {namespace}/{name} was modified concurrently"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_disk_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<()> {
        let api = self.namespaced::<VirtualDisk>(namespace);
        let mut metadata = json!({ "finalizers": finalizers });
        if let Some(version) = resource_version {
            metadata["resourceVersion"] = json!(version);
        }
        match api
            .patch(name, &merge_params(), &Patch::Merge(&json!({ "metadata": metadata })))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if api_code(&e) == Some(404) => Ok(()),
            Err(e) if api_code(&e) == Some(409) => Err(Error::Conflict(format!(
                "VirtualDisk {namespace}/{name} finalizers were modified concurrently"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self
            .namespaced::<PersistentVolumeClaim>(namespace)
            .get_opt(name)
            .await?)
    }

    async fn list_claims(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>> {
        let list = self
            .namespaced::<PersistentVolumeClaim>(namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list.items)
    }

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let namespace = claim.namespace().unwrap_or_default();
        let api = self.namespaced::<PersistentVolumeClaim>(&namespace);
        match api.create(&PostParams::default(), claim).await {
            Ok(created) => Ok(created),
            Err(e) if is_already_exists(&e) => {
                let name = claim.metadata.name.clone().unwrap_or_default();
                Ok(api.get(&name).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        delete_tolerant(&self.namespaced::<PersistentVolumeClaim>(namespace), name).await
    }

    async fn patch_claim_metadata(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
        owner_references: Vec<OwnerReference>,
    ) -> Result<()> {
        let api = self.namespaced::<PersistentVolumeClaim>(namespace);
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "ownerReferences": owner_references,
            }
        });
        patch_tolerant(&api, name, patch).await
    }

    async fn patch_claim_size(&self, namespace: &str, name: &str, size: String) -> Result<()> {
        let api = self.namespaced::<PersistentVolumeClaim>(namespace);
        let patch = json!({
            "spec": { "resources": { "requests": { "storage": size } } }
        });
        patch_tolerant(&api, name, patch).await
    }

    async fn claim_mounted_by_pod(&self, namespace: &str, claim: &str) -> Result<bool> {
        let pods = self
            .namespaced::<Pod>(namespace)
            .list(&ListParams::default())
            .await?;
        Ok(pods.items.iter().any(|pod| {
            let finished = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .is_some_and(|phase| phase == "Succeeded" || phase == "Failed");
            let mounts = pod
                .spec
                .as_ref()
                .and_then(|s| s.volumes.as_ref())
                .is_some_and(|volumes| {
                    volumes.iter().any(|v| {
                        v.persistent_volume_claim
                            .as_ref()
                            .is_some_and(|pvc| pvc.claim_name == claim)
                    })
                });
            !finished && mounts
        }))
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_data_volume(&self, namespace: &str, name: &str) -> Result<Option<DataVolume>> {
        Ok(self.namespaced::<DataVolume>(namespace).get_opt(name).await?)
    }

    async fn create_data_volume(&self, data_volume: &DataVolume) -> Result<()> {
        let namespace = data_volume.namespace().unwrap_or_default();
        match self
            .namespaced::<DataVolume>(&namespace)
            .create(&PostParams::default(), data_volume)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_data_volume(&self, namespace: &str, name: &str) -> Result<()> {
        delete_tolerant(&self.namespaced::<DataVolume>(namespace), name).await
    }

    async fn get_virtual_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachine>> {
        Ok(self
            .namespaced::<VirtualMachine>(namespace)
            .get_opt(name)
            .await?)
    }

    async fn list_virtual_machines(&self, namespace: &str) -> Result<Vec<VirtualMachine>> {
        Ok(self
            .namespaced::<VirtualMachine>(namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn machine_has_active_runtime(&self, namespace: &str, name: &str) -> Result<bool> {
        let params = ListParams::default().labels(&format!("{LABEL_MACHINE_NAME}={name}"));
        let pods = self.namespaced::<Pod>(namespace).list(&params).await?;
        Ok(pods.items.iter().any(|pod| {
            pod.status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .is_some_and(|phase| phase == "Running")
        }))
    }

    async fn list_operations(&self, namespace: &str) -> Result<Vec<VirtualMachineOperation>> {
        Ok(self
            .namespaced::<VirtualMachineOperation>(namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn create_operation(&self, operation: &VirtualMachineOperation) -> Result<()> {
        let namespace = operation.namespace().unwrap_or_default();
        match self
            .namespaced::<VirtualMachineOperation>(&namespace)
            .create(&PostParams::default(), operation)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_operation(&self, namespace: &str, name: &str) -> Result<()> {
        delete_tolerant(&self.namespaced::<VirtualMachineOperation>(namespace), name).await
    }

    async fn get_virtual_image(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualImage>> {
        Ok(self.namespaced::<VirtualImage>(namespace).get_opt(name).await?)
    }

    async fn list_virtual_images(&self, namespace: &str) -> Result<Vec<VirtualImage>> {
        Ok(self
            .namespaced::<VirtualImage>(namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn get_cluster_virtual_image(&self, name: &str) -> Result<Option<ClusterVirtualImage>> {
        let api: Api<ClusterVirtualImage> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_cluster_virtual_images(&self) -> Result<Vec<ClusterVirtualImage>> {
        let api: Api<ClusterVirtualImage> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_disk_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualDiskSnapshot>> {
        Ok(self
            .namespaced::<VirtualDiskSnapshot>(namespace)
            .get_opt(name)
            .await?)
    }

    async fn list_disk_snapshots(&self, namespace: &str) -> Result<Vec<VirtualDiskSnapshot>> {
        Ok(self
            .namespaced::<VirtualDiskSnapshot>(namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn get_volume_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VolumeSnapshot>> {
        Ok(self
            .namespaced::<VolumeSnapshot>(namespace)
            .get_opt(name)
            .await?)
    }

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self
            .namespaced::<Secret>(namespace)
            .get_metadata_opt(name)
            .await?
            .is_some())
    }
}
