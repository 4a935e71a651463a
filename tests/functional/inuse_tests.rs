//! Attachment tracking, InUse transitions and deletion protection.

use kube::ResourceExt;
use vdisk_operator::controller::handler::Outcome;
use vdisk_operator::crd::{
    ConditionType, FINALIZER_PROTECTION, ImageDataSource, ImageObjectRef, ImagePhase, ImageStatus,
    MachinePhase, VirtualImage, VirtualImageSpec,
};

use crate::harness::{DISK, Harness, NAMESPACE, status_is};

fn image_from_disk(h: &Harness) {
    let mut image = VirtualImage::new(
        "golden",
        VirtualImageSpec {
            data_source: ImageDataSource {
                object_ref: Some(ImageObjectRef {
                    kind: "VirtualDisk".to_string(),
                    name: DISK.to_string(),
                    namespace: None,
                }),
            },
            ..Default::default()
        },
    );
    image.metadata.namespace = Some(NAMESPACE.to_string());
    image.status = Some(ImageStatus {
        phase: ImagePhase::Provisioning,
        ..Default::default()
    });
    h.store.insert_image(image);
}

async fn ready_disk(h: &Harness) {
    h.storage_class("sc-a", false);
    h.blank_disk("10Gi", "sc-a");
    h.pass().await;
    h.bind_claim(&h.tracked_claim(), "10Gi");
    h.pass().await;
}

#[tokio::test]
async fn test_machine_outranks_image_creation() {
    let h = Harness::new(Default::default());
    ready_disk(&h).await;
    h.running_machine("vm");
    image_from_disk(&h);

    h.settle().await;

    assert_eq!(
        h.state_of(ConditionType::InUse),
        status_is("True", "AttachedToVirtualMachine")
    );
    let disk = h.disk();
    let attached = &disk.status.as_ref().unwrap().attached_to;
    assert_eq!(attached.len(), 1);
    assert_eq!(attached[0].name, "vm");
    assert!(attached[0].mounted);
}

#[tokio::test]
async fn test_reason_switch_passes_through_not_in_use() {
    let h = Harness::new(Default::default());
    ready_disk(&h).await;
    h.running_machine("vm");
    image_from_disk(&h);
    h.settle().await;

    h.store.remove_machine(NAMESPACE, "vm");
    let outcome = h.pass().await;
    assert_eq!(outcome, Some(Outcome::StopChain));
    assert_eq!(h.state_of(ConditionType::InUse), status_is("False", "NotInUse"));

    h.pass().await;
    assert_eq!(
        h.state_of(ConditionType::InUse),
        status_is("True", "UsedForImageCreation")
    );
}

#[tokio::test]
async fn test_not_in_use_without_consumers() {
    let h = Harness::new(Default::default());
    ready_disk(&h).await;
    h.settle().await;

    assert_eq!(h.state_of(ConditionType::InUse), status_is("False", "NotInUse"));
    assert!(h.disk().status.as_ref().unwrap().attached_to.is_empty());
}

#[tokio::test]
async fn test_protection_follows_attachment() {
    let h = Harness::new(Default::default());
    ready_disk(&h).await;
    h.running_machine("vm");
    h.settle().await;
    assert!(h.disk().finalizers().iter().any(|f| f == FINALIZER_PROTECTION));

    h.store.remove_machine(NAMESPACE, "vm");
    h.settle().await;
    let disk = h.disk();
    assert!(disk.status.as_ref().unwrap().attached_to.is_empty());
    assert!(!disk.finalizers().iter().any(|f| f == FINALIZER_PROTECTION));
}

#[tokio::test]
async fn test_stopped_machine_holds_disk_while_runtime_lingers() {
    let h = Harness::new(Default::default());
    ready_disk(&h).await;
    h.running_machine("vm");
    h.settle().await;

    h.store.update_machine(NAMESPACE, "vm", |vm| {
        if let Some(status) = vm.status.as_mut() {
            status.phase = Some(MachinePhase::Stopped);
        }
    });
    h.store.set_machine_runtime(NAMESPACE, "vm", true);
    h.settle().await;
    assert_eq!(
        h.state_of(ConditionType::InUse),
        status_is("True", "AttachedToVirtualMachine")
    );

    h.store.set_machine_runtime(NAMESPACE, "vm", false);
    h.settle().await;
    assert_eq!(h.state_of(ConditionType::InUse), status_is("False", "NotInUse"));
}
