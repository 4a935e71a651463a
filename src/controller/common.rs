//! Shared controller helpers.
//!
//! Finalizer bookkeeping and the claim operations used by both the
//! provisioning pipelines and the migration handler.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use tracing::debug;

use crate::controller::error::Result;
use crate::crd::{FINALIZER_PROTECTION, FINALIZER_PVC_PROTECTION, VirtualDisk};
use crate::resources::{claim, is_owned_by, owner_reference};
use crate::store::DiskStore;

/// Add a finalizer to a list. Returns whether the list changed.
pub fn add_finalizer(finalizers: &mut Vec<String>, finalizer: &str) -> bool {
    if finalizers.iter().any(|f| f == finalizer) {
        return false;
    }
    finalizers.push(finalizer.to_string());
    true
}

/// Remove a finalizer from a list. Returns whether the list changed.
pub fn remove_finalizer(finalizers: &mut Vec<String>, finalizer: &str) -> bool {
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    finalizers.len() != before
}

/// Staged finalizers of the disk, created on first access.
pub fn disk_finalizers(disk: &mut VirtualDisk) -> &mut Vec<String> {
    disk.metadata.finalizers.get_or_insert_with(Vec::new)
}

/// Adopt a claim and protect it from deletion while the disk uses it.
///
/// The disk becomes the controlling owner; other owner references are kept.
pub async fn protect_claim(
    store: &dyn DiskStore,
    disk: &VirtualDisk,
    claim: &PersistentVolumeClaim,
) -> Result<()> {
    let mut finalizers = claim.finalizers().to_vec();
    let added = add_finalizer(&mut finalizers, FINALIZER_PROTECTION);

    let mut owners = claim.owner_references().to_vec();
    let adopted = !is_owned_by(&owners, disk);
    if adopted {
        owners.retain(|o| o.controller != Some(true));
        owners.push(owner_reference(disk));
    }

    if added || adopted {
        debug!(claim = %claim.name_any(), "Protecting claim");
        store
            .patch_claim_metadata(&claim.namespace().unwrap_or_default(), &claim.name_any(), finalizers, owners)
            .await?;
    }
    Ok(())
}

/// Drop the disk's protection finalizer from a claim.
pub async fn unprotect_claim(store: &dyn DiskStore, claim: &PersistentVolumeClaim) -> Result<()> {
    let mut finalizers = claim.finalizers().to_vec();
    if remove_finalizer(&mut finalizers, FINALIZER_PROTECTION) {
        debug!(claim = %claim.name_any(), "Unprotecting claim");
        store
            .patch_claim_metadata(
                &claim.namespace().unwrap_or_default(),
                &claim.name_any(),
                finalizers,
                claim.owner_references().to_vec(),
            )
            .await?;
    }
    Ok(())
}

/// Delete a claim the disk no longer needs.
///
/// Not-found is success. Once deleted, the protection finalizers are
/// stripped so the claim can go, unless a pod still mounts it: then only
/// the disk's own finalizer is dropped and Kubernetes keeps the claim until
/// the pod is gone.
pub async fn delete_claim(store: &dyn DiskStore, namespace: &str, name: &str) -> Result<()> {
    let Some(claim) = store.get_claim(namespace, name).await? else {
        return Ok(());
    };
    if !claim::is_terminating(&claim) {
        store.delete_claim(namespace, name).await?;
    }

    let mounted = store.claim_mounted_by_pod(namespace, name).await?;
    let mut finalizers = claim.finalizers().to_vec();
    let mut changed = remove_finalizer(&mut finalizers, FINALIZER_PROTECTION);
    if !mounted {
        changed |= remove_finalizer(&mut finalizers, FINALIZER_PVC_PROTECTION);
    }
    if changed {
        store
            .patch_claim_metadata(namespace, name, finalizers, claim.owner_references().to_vec())
            .await?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::crd::VirtualDiskSpec;
    use crate::resources::claim::{ClaimParams, generate_blank_claim};
    use crate::store::MemoryStore;

    fn disk() -> VirtualDisk {
        let mut disk = VirtualDisk::new("root", VirtualDiskSpec::default());
        disk.metadata.namespace = Some("vms".to_string());
        disk.metadata.uid = Some("uid-1".to_string());
        disk
    }

    fn claim(disk: &VirtualDisk, name: &str) -> PersistentVolumeClaim {
        generate_blank_claim(
            disk,
            name,
            &ClaimParams {
                size: "1Gi".to_string(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_finalizer_list_helpers() {
        let mut finalizers = vec!["a".to_string()];
        assert!(add_finalizer(&mut finalizers, "b"));
        assert!(!add_finalizer(&mut finalizers, "b"));
        assert!(remove_finalizer(&mut finalizers, "a"));
        assert!(!remove_finalizer(&mut finalizers, "a"));
        assert_eq!(finalizers, vec!["b"]);
    }

    #[tokio::test]
    async fn test_protect_and_unprotect_claim() {
        let store = MemoryStore::new();
        let disk = disk();
        let mut pvc = claim(&disk, "pvc-1");
        pvc.metadata.owner_references = None;
        let pvc = store.insert_claim(pvc);

        protect_claim(&store, &disk, &pvc).await.unwrap();
        let pvc = store.claim("vms", "pvc-1").unwrap();
        assert!(pvc.finalizers().iter().any(|f| f == FINALIZER_PROTECTION));
        assert!(is_owned_by(pvc.owner_references(), &disk));

        unprotect_claim(&store, &pvc).await.unwrap();
        let pvc = store.claim("vms", "pvc-1").unwrap();
        assert!(pvc.finalizers().is_empty());
    }

    #[tokio::test]
    async fn test_delete_claim_tolerates_missing() {
        let store = MemoryStore::new();
        delete_claim(&store, "vms", "absent").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_mounted_claim_keeps_pvc_protection() {
        let store = MemoryStore::new();
        let disk = disk();
        let mut pvc = claim(&disk, "pvc-1");
        pvc.metadata.finalizers = Some(vec![
            FINALIZER_PVC_PROTECTION.to_string(),
            FINALIZER_PROTECTION.to_string(),
        ]);
        store.insert_claim(pvc);
        store.set_claim_mounted("vms", "pvc-1", true);

        delete_claim(&store, "vms", "pvc-1").await.unwrap();
        let pvc = store.claim("vms", "pvc-1").unwrap();
        assert!(claim::is_terminating(&pvc));
        assert_eq!(pvc.finalizers(), [FINALIZER_PVC_PROTECTION.to_string()]);

        store.set_claim_mounted("vms", "pvc-1", false);
        delete_claim(&store, "vms", "pvc-1").await.unwrap();
        assert!(store.claim("vms", "pvc-1").is_none());
    }
}
