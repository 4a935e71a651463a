//! In-memory cluster driving whole reconciliation passes.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimStatus};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use vdisk_operator::config::OperatorConfig;
use vdisk_operator::controller::context::{Context, RecordingPublisher};
use vdisk_operator::controller::handler::Outcome;
use vdisk_operator::controller::reconciler::Reconciler;
use vdisk_operator::controller::status;
use vdisk_operator::controller::volume_migration::VolumeMigrationReconciler;
use vdisk_operator::crd::{
    BlockDeviceKind, BlockDeviceRef, Condition, ConditionStatus, ConditionType, MachinePhase,
    VirtualDisk, VirtualDiskSpec, VirtualMachine, VirtualMachineSpec, VirtualMachineStatus,
    machine_conditions,
};
use vdisk_operator::store::MemoryStore;

pub const NAMESPACE: &str = "vms";
pub const DISK: &str = "root";

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub events: Arc<RecordingPublisher>,
    pub reconciler: Reconciler,
    pub orchestrator: VolumeMigrationReconciler,
}

impl Harness {
    pub fn new(config: OperatorConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(RecordingPublisher::new());
        let ctx = Arc::new(Context::new(store.clone(), events.clone(), config, None));
        Self {
            store,
            events,
            reconciler: Reconciler::new(ctx.clone()),
            orchestrator: VolumeMigrationReconciler::new(ctx),
        }
    }

    pub fn with_migration() -> Self {
        Self::new(OperatorConfig {
            volume_migration_enabled: true,
            ..Default::default()
        })
    }

    pub fn storage_class(&self, name: &str, wait_for_first_consumer: bool) -> &Self {
        let mode = if wait_for_first_consumer {
            "WaitForFirstConsumer"
        } else {
            "Immediate"
        };
        self.store.insert_storage_class(StorageClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            provisioner: "csi.example.com".to_string(),
            volume_binding_mode: Some(mode.to_string()),
            ..Default::default()
        });
        self
    }

    /// A blank disk of `size` on `class`.
    pub fn blank_disk(&self, size: &str, class: &str) {
        let mut disk = VirtualDisk::new(DISK, VirtualDiskSpec::default());
        disk.metadata.namespace = Some(NAMESPACE.to_string());
        disk.spec.persistent_volume_claim.size = Some(size.to_string());
        disk.spec.persistent_volume_claim.storage_class_name = Some(class.to_string());
        self.store.insert_disk(disk);
    }

    /// A running machine with the disk attached.
    pub fn running_machine(&self, name: &str) {
        let refs = vec![BlockDeviceRef {
            kind: BlockDeviceKind::VirtualDisk,
            name: DISK.to_string(),
        }];
        let mut vm = VirtualMachine::new(name, VirtualMachineSpec::default());
        vm.metadata.namespace = Some(NAMESPACE.to_string());
        vm.spec.block_device_refs = refs.clone();
        vm.status = Some(VirtualMachineStatus {
            phase: Some(MachinePhase::Running),
            block_device_refs: refs,
            conditions: vec![Condition::new(
                machine_conditions::RUNNING,
                ConditionStatus::True,
                "",
                "",
                None,
            )],
            ..Default::default()
        });
        self.store.insert_machine(vm);
    }

    pub async fn pass(&self) -> Option<Outcome> {
        self.reconciler
            .reconcile_pass(NAMESPACE, DISK)
            .await
            .expect("reconcile pass")
    }

    /// Run passes until one does not ask to be rerun right away.
    pub async fn settle(&self) -> Option<Outcome> {
        for _ in 0..5 {
            let outcome = self.pass().await;
            if outcome != Some(Outcome::StopChain) {
                return outcome;
            }
        }
        panic!("disk did not settle");
    }

    pub async fn orchestrate(&self) -> Option<Outcome> {
        self.orchestrator
            .reconcile_pass(NAMESPACE, DISK)
            .await
            .expect("orchestrator pass")
    }

    pub fn disk(&self) -> VirtualDisk {
        self.store.disk(NAMESPACE, DISK).expect("disk exists")
    }

    pub fn condition(&self, condition_type: ConditionType) -> Option<Condition> {
        status::get(self.disk().conditions(), condition_type).cloned()
    }

    /// Status and reason of a condition, for compact assertions.
    pub fn state_of(&self, condition_type: ConditionType) -> Option<(String, String)> {
        self.condition(condition_type)
            .map(|c| (c.status, c.reason))
    }

    pub fn claim(&self, name: &str) -> Option<PersistentVolumeClaim> {
        self.store.claim(NAMESPACE, name)
    }

    pub fn tracked_claim(&self) -> String {
        self.disk()
            .tracked_claim_name()
            .expect("tracked claim")
            .to_string()
    }

    pub fn bind_claim(&self, name: &str, capacity: &str) {
        self.store.update_claim(NAMESPACE, name, |claim| {
            claim.status = Some(PersistentVolumeClaimStatus {
                phase: Some("Bound".to_string()),
                capacity: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(capacity.to_string()),
                )])),
                ..Default::default()
            });
        });
    }

    /// A claim that is gone or on its way out.
    pub fn claim_removed(&self, name: &str) -> bool {
        self.claim(name)
            .is_none_or(|c| c.metadata.deletion_timestamp.is_some())
    }

    /// Claims other than `source` in the namespace.
    pub fn other_claims(&self, source: &str) -> Vec<String> {
        self.store
            .claims(NAMESPACE)
            .into_iter()
            .filter_map(|c| c.metadata.name)
            .filter(|name| name != source)
            .collect()
    }

    /// Provision a Ready disk on `class` with a running machine attached.
    pub async fn ready_attached_disk(&self, class: &str) -> String {
        self.blank_disk("10Gi", class);
        self.pass().await;
        let claim = self.tracked_claim();
        self.bind_claim(&claim, "10Gi");
        self.pass().await;
        self.running_machine("vm");
        self.settle().await;
        claim
    }
}

pub fn status_is(status: &str, reason: &str) -> Option<(String, String)> {
    Some((status.to_string(), reason.to_string()))
}
