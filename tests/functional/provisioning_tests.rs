//! Provisioning a blank disk from an empty namespace to Ready.

use std::time::Duration;

use kube::ResourceExt;
use vdisk_operator::controller::handler::Outcome;
use vdisk_operator::crd::{
    ConditionType, DiskPhase, FINALIZER_CLEANUP, FINALIZER_PROTECTION, VirtualDisk,
    VirtualDiskSpec,
};

use crate::harness::{DISK, Harness, NAMESPACE, status_is};

#[tokio::test]
async fn test_first_pass_creates_blank_claim() {
    let h = Harness::new(Default::default());
    h.storage_class("sc-a", false);
    h.blank_disk("10Gi", "sc-a");

    h.pass().await;

    let disk = h.disk();
    let claim_name = h.tracked_claim();
    let claim = h.claim(&claim_name).expect("blank claim created");
    let spec = claim.spec.as_ref().unwrap();
    assert_eq!(spec.storage_class_name.as_deref(), Some("sc-a"));

    assert_eq!(disk.phase(), DiskPhase::Provisioning);
    assert_eq!(h.state_of(ConditionType::Ready), status_is("False", "Provisioning"));
    assert_eq!(
        h.state_of(ConditionType::DatasourceReady),
        status_is("True", "DatasourceReady")
    );
    assert!(disk.finalizers().iter().any(|f| f == FINALIZER_CLEANUP));
    assert_eq!(disk.status.as_ref().unwrap().observed_generation, Some(1));
}

#[tokio::test]
async fn test_pending_claim_is_polled_shortly() {
    let h = Harness::new(Default::default());
    h.storage_class("sc-a", false);
    h.blank_disk("10Gi", "sc-a");

    // Creating the claim and waiting for it to bind both come back soon.
    for _ in 0..2 {
        let Some(Outcome::RequeueAfter(delay)) = h.pass().await else {
            panic!("pending claim not requeued");
        };
        assert!(delay <= Duration::from_secs(5));
    }
    assert_eq!(h.disk().phase(), DiskPhase::Provisioning);
    assert_eq!(h.store.claims("vms").len(), 1);

    h.bind_claim(&h.tracked_claim(), "10Gi");
    assert_eq!(h.pass().await, Some(Outcome::Continue));
    assert_eq!(h.disk().phase(), DiskPhase::Ready);
}

#[tokio::test]
async fn test_malformed_size_fails_without_claim() {
    let h = Harness::new(Default::default());
    h.storage_class("sc-a", false);
    h.blank_disk("ten-gigs", "sc-a");

    h.pass().await;

    assert_eq!(h.disk().phase(), DiskPhase::Failed);
    let ready = h.state_of(ConditionType::Ready);
    assert_eq!(ready, status_is("False", "ProvisioningFailed"));
    assert!(h.store.claims("vms").is_empty());
}

#[tokio::test]
async fn test_bound_claim_makes_disk_ready() {
    let h = Harness::new(Default::default());
    h.storage_class("sc-a", false);
    h.blank_disk("10Gi", "sc-a");
    h.pass().await;
    let claim_name = h.tracked_claim();

    h.bind_claim(&claim_name, "10Gi");
    h.pass().await;

    let disk = h.disk();
    let status = disk.status.as_ref().unwrap();
    assert_eq!(status.phase, DiskPhase::Ready);
    assert_eq!(h.state_of(ConditionType::Ready), status_is("True", "Ready"));
    assert_eq!(status.progress.as_deref(), Some("100%"));
    assert_eq!(status.capacity.as_deref(), Some("10Gi"));
    assert_eq!(status.storage_class_name.as_deref(), Some("sc-a"));
    assert!(status.stats.creation_duration.is_some());

    // The claim is adopted and protected once the disk is ready.
    let claim = h.claim(&claim_name).unwrap();
    assert!(
        claim
            .metadata
            .finalizers
            .unwrap_or_default()
            .iter()
            .any(|f| f == FINALIZER_PROTECTION)
    );
}

#[tokio::test]
async fn test_ready_disk_is_stable() {
    let h = Harness::new(Default::default());
    h.storage_class("sc-a", false);
    h.blank_disk("10Gi", "sc-a");
    h.pass().await;
    h.bind_claim(&h.tracked_claim(), "10Gi");
    h.pass().await;

    let writes = h.store.status_writes();
    let before = h.disk().status;
    h.pass().await;
    assert_eq!(h.disk().status, before);
    assert_eq!(h.store.status_writes(), writes);
}

#[tokio::test]
async fn test_blank_disk_without_size_fails() {
    let h = Harness::new(Default::default());
    h.storage_class("sc-a", false);
    let mut disk = VirtualDisk::new(DISK, VirtualDiskSpec::default());
    disk.metadata.namespace = Some(NAMESPACE.to_string());
    disk.spec.persistent_volume_claim.storage_class_name = Some("sc-a".to_string());
    h.store.insert_disk(disk);

    h.pass().await;

    assert_eq!(h.disk().phase(), DiskPhase::Failed);
    assert_eq!(
        h.state_of(ConditionType::Ready),
        status_is("False", "ProvisioningFailed")
    );
    assert!(h.store.claims("vms").is_empty());
}

#[tokio::test]
async fn test_missing_storage_class_blocks_provisioning() {
    let h = Harness::new(Default::default());
    h.blank_disk("10Gi", "sc-missing");

    h.pass().await;

    assert_eq!(
        h.state_of(ConditionType::Ready),
        status_is("False", "StorageClassIsNotReady")
    );
    assert_eq!(
        h.state_of(ConditionType::StorageClassReady),
        status_is("False", "StorageClassNotFound")
    );
    assert!(h.store.claims("vms").is_empty());
}

#[tokio::test]
async fn test_at_most_one_condition_per_type() {
    let h = Harness::new(Default::default());
    h.storage_class("sc-a", false);
    h.blank_disk("10Gi", "sc-a");
    h.pass().await;
    h.bind_claim(&h.tracked_claim(), "10Gi");
    h.pass().await;
    h.running_machine("vm");
    h.settle().await;

    let disk = h.disk();
    let mut types: Vec<&str> = disk.conditions().iter().map(|c| c.r#type.as_str()).collect();
    let total = types.len();
    types.sort_unstable();
    types.dedup();
    assert_eq!(types.len(), total);
    assert!(
        disk.conditions()
            .iter()
            .all(|c| c.observed_generation.unwrap_or(0) <= disk.generation())
    );
}
