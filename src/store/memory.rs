//! In-memory [`DiskStore`].
//!
//! Mimics the API server semantics the controllers depend on: resource
//! versions and optimistic concurrency on status writes, `generateName`,
//! finalizer-gated deletion and creation timestamps. Used by the test
//! suites and for dry runs without a cluster.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use kube::ResourceExt;

use super::DiskStore;
use crate::controller::error::{Error, Result};
use crate::crd::{
    ClusterVirtualImage, DataVolume, VirtualDisk, VirtualDiskSnapshot, VirtualImage,
    VirtualMachine, VirtualMachineOperation, VolumeSnapshot,
};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct State {
    counter: u64,
    disks: BTreeMap<Key, VirtualDisk>,
    claims: BTreeMap<Key, PersistentVolumeClaim>,
    storage_classes: BTreeMap<String, StorageClass>,
    data_volumes: BTreeMap<Key, DataVolume>,
    machines: BTreeMap<Key, VirtualMachine>,
    operations: BTreeMap<Key, VirtualMachineOperation>,
    images: BTreeMap<Key, VirtualImage>,
    cluster_images: BTreeMap<String, ClusterVirtualImage>,
    disk_snapshots: BTreeMap<Key, VirtualDiskSnapshot>,
    volume_snapshots: BTreeMap<Key, VolumeSnapshot>,
    secrets: BTreeSet<Key>,
    mounted_claims: BTreeSet<Key>,
    active_runtimes: BTreeSet<Key>,
    status_writes: u64,
}

impl State {
    fn next(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Stamp server-populated metadata on a newly created object.
    fn admit(&mut self, meta: &mut ObjectMeta) -> String {
        let n = self.next();
        if meta.name.is_none() {
            let prefix = meta.generate_name.clone().unwrap_or_default();
            meta.name = Some(format!("{prefix}{n:05x}"));
        }
        meta.uid.get_or_insert_with(|| format!("uid-{n}"));
        meta.resource_version = Some(n.to_string());
        meta.generation.get_or_insert(1);
        meta.creation_timestamp
            .get_or_insert_with(|| Time(jiff::Timestamp::now()));
        meta.name.clone().unwrap_or_default()
    }

    fn touch(&mut self, meta: &mut ObjectMeta) {
        let n = self.next();
        meta.resource_version = Some(n.to_string());
    }
}

/// Mark an object deleted, or report that it can be dropped right away.
fn mark_deleted(meta: &mut ObjectMeta) -> bool {
    if meta.finalizers.as_ref().is_none_or(Vec::is_empty) {
        return true;
    }
    meta.deletion_timestamp
        .get_or_insert_with(|| Time(jiff::Timestamp::now()));
    false
}

fn releasable(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some() && meta.finalizers.as_ref().is_none_or(Vec::is_empty)
}

/// Store keeping every object in process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ========================================================================
    // Seeding
    // ========================================================================

    /// Insert (or replace) a disk, returning it as stored.
    pub fn insert_disk(&self, mut disk: VirtualDisk) -> VirtualDisk {
        let mut state = self.state();
        let namespace = disk.namespace().unwrap_or_default();
        let name = state.admit(&mut disk.metadata);
        state.disks.insert(key(&namespace, &name), disk.clone());
        disk
    }

    pub fn insert_claim(&self, mut claim: PersistentVolumeClaim) -> PersistentVolumeClaim {
        let mut state = self.state();
        let namespace = claim.namespace().unwrap_or_default();
        let name = state.admit(&mut claim.metadata);
        state.claims.insert(key(&namespace, &name), claim.clone());
        claim
    }

    pub fn insert_storage_class(&self, mut class: StorageClass) {
        let mut state = self.state();
        let name = state.admit(&mut class.metadata);
        state.storage_classes.insert(name, class);
    }

    pub fn insert_data_volume(&self, mut data_volume: DataVolume) {
        let mut state = self.state();
        let namespace = data_volume.namespace().unwrap_or_default();
        let name = state.admit(&mut data_volume.metadata);
        state.data_volumes.insert(key(&namespace, &name), data_volume);
    }

    pub fn insert_machine(&self, mut machine: VirtualMachine) {
        let mut state = self.state();
        let namespace = machine.namespace().unwrap_or_default();
        let name = state.admit(&mut machine.metadata);
        state.machines.insert(key(&namespace, &name), machine);
    }

    pub fn insert_operation(&self, mut operation: VirtualMachineOperation) -> String {
        let mut state = self.state();
        let namespace = operation.namespace().unwrap_or_default();
        let name = state.admit(&mut operation.metadata);
        state.operations.insert(key(&namespace, &name), operation);
        name
    }

    pub fn insert_image(&self, mut image: VirtualImage) {
        let mut state = self.state();
        let namespace = image.namespace().unwrap_or_default();
        let name = state.admit(&mut image.metadata);
        state.images.insert(key(&namespace, &name), image);
    }

    pub fn insert_disk_snapshot(&self, mut snapshot: VirtualDiskSnapshot) {
        let mut state = self.state();
        let namespace = snapshot.namespace().unwrap_or_default();
        let name = state.admit(&mut snapshot.metadata);
        state.disk_snapshots.insert(key(&namespace, &name), snapshot);
    }

    pub fn insert_volume_snapshot(&self, mut snapshot: VolumeSnapshot) {
        let mut state = self.state();
        let namespace = snapshot.namespace().unwrap_or_default();
        let name = state.admit(&mut snapshot.metadata);
        state.volume_snapshots.insert(key(&namespace, &name), snapshot);
    }

    pub fn insert_secret(&self, namespace: &str, name: &str) {
        self.state().secrets.insert(key(namespace, name));
    }

    /// Simulate a pod mounting (or releasing) a claim.
    pub fn set_claim_mounted(&self, namespace: &str, claim: &str, mounted: bool) {
        let mut state = self.state();
        if mounted {
            state.mounted_claims.insert(key(namespace, claim));
        } else {
            state.mounted_claims.remove(&key(namespace, claim));
        }
    }

    /// Simulate a running launcher pod for a machine.
    pub fn set_machine_runtime(&self, namespace: &str, machine: &str, active: bool) {
        let mut state = self.state();
        if active {
            state.active_runtimes.insert(key(namespace, machine));
        } else {
            state.active_runtimes.remove(&key(namespace, machine));
        }
    }

    // ========================================================================
    // Mutation from the outside world
    // ========================================================================

    /// Edit a disk's metadata or status as another actor would.
    pub fn update_disk(&self, namespace: &str, name: &str, f: impl FnOnce(&mut VirtualDisk)) {
        let mut state = self.state();
        let Some(mut disk) = state.disks.remove(&key(namespace, name)) else {
            return;
        };
        f(&mut disk);
        state.touch(&mut disk.metadata);
        state.disks.insert(key(namespace, name), disk);
    }

    /// Edit a disk's spec, bumping its generation.
    pub fn update_disk_spec(&self, namespace: &str, name: &str, f: impl FnOnce(&mut VirtualDisk)) {
        self.update_disk(namespace, name, |disk| {
            f(disk);
            disk.metadata.generation = Some(disk.metadata.generation.unwrap_or(0) + 1);
        });
    }

    pub fn update_claim(
        &self,
        namespace: &str,
        name: &str,
        f: impl FnOnce(&mut PersistentVolumeClaim),
    ) {
        let mut state = self.state();
        let Some(mut claim) = state.claims.remove(&key(namespace, name)) else {
            return;
        };
        f(&mut claim);
        state.touch(&mut claim.metadata);
        state.claims.insert(key(namespace, name), claim);
    }

    pub fn update_machine(&self, namespace: &str, name: &str, f: impl FnOnce(&mut VirtualMachine)) {
        if let Some(machine) = self.state().machines.get_mut(&key(namespace, name)) {
            f(machine);
        }
    }

    pub fn remove_machine(&self, namespace: &str, name: &str) {
        self.state().machines.remove(&key(namespace, name));
    }

    pub fn update_operation(
        &self,
        namespace: &str,
        name: &str,
        f: impl FnOnce(&mut VirtualMachineOperation),
    ) {
        if let Some(op) = self.state().operations.get_mut(&key(namespace, name)) {
            f(op);
        }
    }

    pub fn update_storage_class(&self, name: &str, f: impl FnOnce(&mut StorageClass)) {
        if let Some(class) = self.state().storage_classes.get_mut(name) {
            f(class);
        }
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn disk(&self, namespace: &str, name: &str) -> Option<VirtualDisk> {
        self.state().disks.get(&key(namespace, name)).cloned()
    }

    pub fn claim(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.state().claims.get(&key(namespace, name)).cloned()
    }

    pub fn claims(&self, namespace: &str) -> Vec<PersistentVolumeClaim> {
        self.state()
            .claims
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, claim)| claim.clone())
            .collect()
    }

    pub fn data_volume(&self, namespace: &str, name: &str) -> Option<DataVolume> {
        self.state().data_volumes.get(&key(namespace, name)).cloned()
    }

    pub fn operations(&self, namespace: &str) -> Vec<VirtualMachineOperation> {
        self.state()
            .operations
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, op)| op.clone())
            .collect()
    }

    /// Number of status writes accepted so far.
    pub fn status_writes(&self) -> u64 {
        self.state().status_writes
    }
}

fn in_namespace<T: Clone>(map: &BTreeMap<Key, T>, namespace: &str) -> Vec<T> {
    map.iter()
        .filter(|((ns, _), _)| ns == namespace)
        .map(|(_, value)| value.clone())
        .collect()
}

#[async_trait]
impl DiskStore for MemoryStore {
    async fn get_disk(&self, namespace: &str, name: &str) -> Result<Option<VirtualDisk>> {
        Ok(self.disk(namespace, name))
    }

    async fn patch_disk_status(&self, disk: &VirtualDisk) -> Result<Option<String>> {
        let namespace = disk.namespace().unwrap_or_default();
        let name = disk.name_any();
        let mut state = self.state();
        let Some(mut stored) = state.disks.remove(&key(&namespace, &name)) else {
            return Ok(None);
        };
        if stored.metadata.resource_version != disk.metadata.resource_version {
            state.disks.insert(key(&namespace, &name), stored);
            return Err(Error::Conflict(format!(
                "VirtualDisk {namespace}/{name} was modified concurrently"
            )));
        }
        stored.status = disk.status.clone();
        state.touch(&mut stored.metadata);
        state.status_writes += 1;
        let version = stored.metadata.resource_version.clone();
        state.disks.insert(key(&namespace, &name), stored);
        Ok(version)
    }

    async fn patch_disk_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<()> {
        let mut state = self.state();
        let k = key(namespace, name);
        let Some(mut disk) = state.disks.remove(&k) else {
            return Ok(());
        };
        if resource_version.is_some() && disk.metadata.resource_version != resource_version {
            state.disks.insert(k, disk);
            return Err(Error::Conflict(format!(
                "VirtualDisk {namespace}/{name} finalizers were modified concurrently"
            )));
        }
        disk.metadata.finalizers = Some(finalizers);
        if releasable(&disk.metadata) {
            return Ok(());
        }
        state.touch(&mut disk.metadata);
        state.disks.insert(k, disk);
        Ok(())
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.claim(namespace, name))
    }

    async fn list_claims(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(self.claims(namespace))
    }

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let namespace = claim.namespace().unwrap_or_default();
        if let Some(name) = claim.metadata.name.as_deref()
            && let Some(existing) = self.claim(&namespace, name)
        {
            return Ok(existing);
        }
        Ok(self.insert_claim(claim.clone()))
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        let k = key(namespace, name);
        let drop_now = match state.claims.get_mut(&k) {
            Some(claim) => mark_deleted(&mut claim.metadata),
            None => false,
        };
        if drop_now {
            state.claims.remove(&k);
        }
        Ok(())
    }

    async fn patch_claim_metadata(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
        owner_references: Vec<OwnerReference>,
    ) -> Result<()> {
        let mut state = self.state();
        let k = key(namespace, name);
        let Some(mut claim) = state.claims.remove(&k) else {
            return Ok(());
        };
        claim.metadata.finalizers = Some(finalizers);
        claim.metadata.owner_references = Some(owner_references);
        if releasable(&claim.metadata) {
            return Ok(());
        }
        state.touch(&mut claim.metadata);
        state.claims.insert(k, claim);
        Ok(())
    }

    async fn patch_claim_size(&self, namespace: &str, name: &str, size: String) -> Result<()> {
        self.update_claim(namespace, name, |claim| {
            let spec = claim.spec.get_or_insert_with(Default::default);
            let resources = spec.resources.get_or_insert_with(Default::default);
            resources
                .requests
                .get_or_insert_with(BTreeMap::new)
                .insert(
                    "storage".to_string(),
                    k8s_openapi::apimachinery::pkg::api::resource::Quantity(size),
                );
        });
        Ok(())
    }

    async fn claim_mounted_by_pod(&self, namespace: &str, claim: &str) -> Result<bool> {
        Ok(self.state().mounted_claims.contains(&key(namespace, claim)))
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        Ok(self.state().storage_classes.get(name).cloned())
    }

    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>> {
        Ok(self.state().storage_classes.values().cloned().collect())
    }

    async fn get_data_volume(&self, namespace: &str, name: &str) -> Result<Option<DataVolume>> {
        Ok(self.data_volume(namespace, name))
    }

    async fn create_data_volume(&self, data_volume: &DataVolume) -> Result<()> {
        let namespace = data_volume.namespace().unwrap_or_default();
        let name = data_volume.name_any();
        if self.data_volume(&namespace, &name).is_none() {
            self.insert_data_volume(data_volume.clone());
        }
        Ok(())
    }

    async fn delete_data_volume(&self, namespace: &str, name: &str) -> Result<()> {
        self.state().data_volumes.remove(&key(namespace, name));
        Ok(())
    }

    async fn get_virtual_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachine>> {
        Ok(self.state().machines.get(&key(namespace, name)).cloned())
    }

    async fn list_virtual_machines(&self, namespace: &str) -> Result<Vec<VirtualMachine>> {
        Ok(in_namespace(&self.state().machines, namespace))
    }

    async fn machine_has_active_runtime(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self.state().active_runtimes.contains(&key(namespace, name)))
    }

    async fn list_operations(&self, namespace: &str) -> Result<Vec<VirtualMachineOperation>> {
        Ok(self.operations(namespace))
    }

    async fn create_operation(&self, operation: &VirtualMachineOperation) -> Result<()> {
        self.insert_operation(operation.clone());
        Ok(())
    }

    async fn delete_operation(&self, namespace: &str, name: &str) -> Result<()> {
        self.state().operations.remove(&key(namespace, name));
        Ok(())
    }

    async fn get_virtual_image(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualImage>> {
        Ok(self.state().images.get(&key(namespace, name)).cloned())
    }

    async fn list_virtual_images(&self, namespace: &str) -> Result<Vec<VirtualImage>> {
        Ok(in_namespace(&self.state().images, namespace))
    }

    async fn get_cluster_virtual_image(&self, name: &str) -> Result<Option<ClusterVirtualImage>> {
        Ok(self.state().cluster_images.get(name).cloned())
    }

    async fn list_cluster_virtual_images(&self) -> Result<Vec<ClusterVirtualImage>> {
        Ok(self.state().cluster_images.values().cloned().collect())
    }

    async fn get_disk_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualDiskSnapshot>> {
        Ok(self.state().disk_snapshots.get(&key(namespace, name)).cloned())
    }

    async fn list_disk_snapshots(&self, namespace: &str) -> Result<Vec<VirtualDiskSnapshot>> {
        Ok(in_namespace(&self.state().disk_snapshots, namespace))
    }

    async fn get_volume_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VolumeSnapshot>> {
        Ok(self
            .state()
            .volume_snapshots
            .get(&key(namespace, name))
            .cloned())
    }

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self.state().secrets.contains(&key(namespace, name)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::crd::VirtualDiskSpec;

    fn claim(name: Option<&str>, generate: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: name.map(String::from),
                generate_name: generate.map(String::from),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_generate_name() {
        let store = MemoryStore::new();
        let created = store
            .create_claim(&claim(None, Some("vd-root-")))
            .await
            .unwrap();
        assert!(created.name_any().starts_with("vd-root-"));
        assert!(store.claim("default", &created.name_any()).is_some());
    }

    #[tokio::test]
    async fn test_finalizer_gates_deletion() {
        let store = MemoryStore::new();
        let mut pvc = claim(Some("data"), None);
        pvc.metadata.finalizers = Some(vec!["x".to_string()]);
        store.insert_claim(pvc);

        store.delete_claim("default", "data").await.unwrap();
        let held = store.claim("default", "data").unwrap();
        assert!(held.metadata.deletion_timestamp.is_some());

        store
            .patch_claim_metadata("default", "data", vec![], vec![])
            .await
            .unwrap();
        assert!(store.claim("default", "data").is_none());
    }

    #[tokio::test]
    async fn test_stale_status_write_conflicts() {
        let store = MemoryStore::new();
        let mut disk = VirtualDisk::new("root", VirtualDiskSpec::default());
        disk.metadata.namespace = Some("default".to_string());
        let disk = store.insert_disk(disk);

        store.update_disk("default", "root", |d| {
            d.metadata.labels = Some(Default::default());
        });

        let err = store.patch_disk_status(&disk).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.status_writes(), 0);
    }

    #[tokio::test]
    async fn test_stale_finalizer_write_conflicts() {
        let store = MemoryStore::new();
        let mut disk = VirtualDisk::new("root", VirtualDiskSpec::default());
        disk.metadata.namespace = Some("default".to_string());
        disk.metadata.finalizers = Some(vec!["other/keep".to_string()]);
        let disk = store.insert_disk(disk);
        let stale = disk.resource_version();

        store.update_disk("default", "root", |d| {
            d.metadata.finalizers = Some(vec!["other/keep".to_string(), "other/new".to_string()]);
        });

        let err = store
            .patch_disk_finalizers("default", "root", vec![], stale)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.disk("default", "root").unwrap().finalizers().len(), 2);
    }

    #[tokio::test]
    async fn test_status_write_returns_new_version() {
        let store = MemoryStore::new();
        let mut disk = VirtualDisk::new("root", VirtualDiskSpec::default());
        disk.metadata.namespace = Some("default".to_string());
        let disk = store.insert_disk(disk);

        let version = store.patch_disk_status(&disk).await.unwrap();
        assert!(version.is_some());
        assert_ne!(version, disk.resource_version());

        store
            .patch_disk_finalizers("default", "root", vec!["a/b".to_string()], version)
            .await
            .unwrap();
        assert_eq!(store.disk("default", "root").unwrap().finalizers(), ["a/b".to_string()]);
    }
}
