// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Property-based tests for vdisk-operator.
//!
//! Uses proptest to generate random inputs and verify invariants.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use jiff::{SignedDuration, Timestamp};
use k8s_openapi::api::core::v1::PersistentVolumeClaimStatus;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use proptest::prelude::*;

use vdisk_operator::config::OperatorConfig;
use vdisk_operator::controller::attachment::{InUseDecision, UsageFacts, decide};
use vdisk_operator::controller::context::{Context, RecordingPublisher};
use vdisk_operator::controller::error::exponential_backoff;
use vdisk_operator::controller::handler::Outcome;
use vdisk_operator::controller::reconciler::Reconciler;
use vdisk_operator::controller::status;
use vdisk_operator::controller::volume_migration::trigger::{
    BACKOFF_BASE, BACKOFF_MAX, next_attempt_at,
};
use vdisk_operator::crd::{
    BlockDeviceKind, BlockDeviceRef, Condition, ConditionStatus, ConditionType, InUseReason,
    MachinePhase, OperationPhase, VirtualDisk, VirtualDiskSpec, VirtualMachine,
    VirtualMachineOperationStatus, VirtualMachineSpec, VirtualMachineStatus, machine_conditions,
};
use vdisk_operator::resources::operation::generate_volume_migration;
use vdisk_operator::store::MemoryStore;

fn any_condition_type() -> impl Strategy<Value = ConditionType> {
    prop::sample::select(ConditionType::ALL.to_vec())
}

fn any_status() -> impl Strategy<Value = ConditionStatus> {
    prop_oneof![
        Just(ConditionStatus::True),
        Just(ConditionStatus::False),
        Just(ConditionStatus::Unknown),
    ]
}

fn any_facts() -> impl Strategy<Value = UsageFacts> {
    (any::<bool>(), any::<bool>(), any::<bool>()).prop_map(|(attached, image_creation, export)| {
        UsageFacts {
            attached,
            image_creation,
            export,
        }
    })
}

fn any_finished_phase() -> impl Strategy<Value = OperationPhase> {
    prop_oneof![Just(OperationPhase::Completed), Just(OperationPhase::Failed)]
}

fn wffc_class(name: &str) -> StorageClass {
    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        provisioner: "csi.example.com".to_string(),
        volume_binding_mode: Some("WaitForFirstConsumer".to_string()),
        ..Default::default()
    }
}

fn bind(store: &MemoryStore, claim: &str) {
    store.update_claim("vms", claim, |pvc| {
        pvc.status = Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".to_string()),
            capacity: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity("10Gi".to_string()),
            )])),
            ..Default::default()
        });
    });
}

fn running_machine() -> VirtualMachine {
    let refs = vec![BlockDeviceRef {
        kind: BlockDeviceKind::VirtualDisk,
        name: "root".to_string(),
    }];
    let mut vm = VirtualMachine::new("vm", VirtualMachineSpec::default());
    vm.metadata.namespace = Some("vms".to_string());
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
    vm
}

async fn settle(reconciler: &Reconciler) {
    for _ in 0..5 {
        let outcome = reconciler.reconcile_pass("vms", "root").await.unwrap();
        if outcome != Some(Outcome::StopChain) {
            return;
        }
    }
}

/// Claims other than the source left after `passes` passes over a disk
/// whose class moved from sc-a to sc-b. The target binds after `bind_after`.
async fn migration_targets(passes: usize, bind_after: Option<usize>) -> Vec<String> {
    let store = Arc::new(MemoryStore::new());
    store.insert_storage_class(wffc_class("sc-a"));
    store.insert_storage_class(wffc_class("sc-b"));
    let config = OperatorConfig {
        volume_migration_enabled: true,
        ..Default::default()
    };
    let ctx = Context::new(store.clone(), Arc::new(RecordingPublisher::new()), config, None);
    let reconciler = Reconciler::new(Arc::new(ctx));

    let mut disk = VirtualDisk::new("root", VirtualDiskSpec::default());
    disk.metadata.namespace = Some("vms".to_string());
    disk.spec.persistent_volume_claim.size = Some("10Gi".to_string());
    disk.spec.persistent_volume_claim.storage_class_name = Some("sc-a".to_string());
    store.insert_disk(disk);

    settle(&reconciler).await;
    let source = store
        .disk("vms", "root")
        .and_then(|d| d.tracked_claim_name().map(String::from))
        .unwrap();
    bind(&store, &source);
    settle(&reconciler).await;
    store.insert_machine(running_machine());
    settle(&reconciler).await;

    store.update_disk_spec("vms", "root", |disk| {
        disk.spec.persistent_volume_claim.storage_class_name = Some("sc-b".to_string());
    });
    for pass in 0..passes {
        if bind_after == Some(pass) {
            let disk = store.disk("vms", "root").unwrap();
            if let Some(target) = disk.migration_state().map(|m| m.target_pvc.clone()) {
                bind(&store, &target);
            }
        }
        reconciler.reconcile_pass("vms", "root").await.unwrap();
    }

    store
        .claims("vms")
        .into_iter()
        .filter(|c| c.metadata.deletion_timestamp.is_none())
        .filter_map(|c| c.metadata.name)
        .filter(|name| *name != source)
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Repeating migration passes never creates a second target claim.
    #[test]
    fn migration_creates_single_target(passes in 1usize..8, bind_after in prop::option::of(0usize..8)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let targets = runtime.block_on(migration_targets(passes, bind_after));
        prop_assert_eq!(targets.len(), 1);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Any sequence of upserts leaves at most one condition per type.
    #[test]
    fn condition_set_keeps_one_per_type(
        writes in prop::collection::vec((any_condition_type(), any_status(), 1i64..10), 0..40)
    ) {
        let mut conditions = Vec::new();
        for (condition_type, condition_status, generation) in &writes {
            status::set(
                &mut conditions,
                Condition::new(condition_type.as_str(), *condition_status, "Reason", "", Some(*generation)),
            );
        }

        for condition_type in ConditionType::ALL {
            let count = conditions
                .iter()
                .filter(|c| c.r#type == condition_type.as_str())
                .count();
            prop_assert!(count <= 1);
        }

        // The last write of each type wins.
        for condition_type in ConditionType::ALL {
            let last = writes.iter().rev().find(|(t, _, _)| *t == condition_type);
            let current = status::get(&conditions, condition_type);
            match last {
                Some((_, condition_status, generation)) => {
                    let current = current.unwrap();
                    prop_assert_eq!(&current.status, condition_status.as_str());
                    prop_assert_eq!(current.observed_generation, Some(*generation));
                }
                None => prop_assert!(current.is_none()),
            }
        }
    }

    /// Removing a type never touches the others.
    #[test]
    fn condition_remove_is_local(
        types in prop::collection::hash_set(any_condition_type(), 1..8),
        victim in any_condition_type(),
    ) {
        let mut conditions = Vec::new();
        for condition_type in &types {
            status::set(
                &mut conditions,
                Condition::new(condition_type.as_str(), ConditionStatus::True, "Reason", "", Some(1)),
            );
        }
        status::remove(&mut conditions, victim);

        prop_assert!(status::get(&conditions, victim).is_none());
        for condition_type in types.iter().filter(|t| **t != victim) {
            prop_assert!(status::get(&conditions, *condition_type).is_some());
        }
    }

    /// InUse never moves from one in-use reason straight to another.
    #[test]
    fn inuse_switches_through_false(
        observations in prop::collection::vec(any_facts(), 1..30)
    ) {
        let mut current: Option<(bool, InUseReason)> = None;
        for facts in &observations {
            let InUseDecision::Set { in_use, reason, stop } = decide(current.clone(), facts) else {
                continue;
            };
            if let Some((true, previous)) = &current {
                if in_use {
                    prop_assert_eq!(previous, &reason);
                }
            }
            prop_assert!(!matches!(reason, InUseReason::Retained(_)));
            if stop {
                prop_assert!(!in_use);
            }
            current = Some((in_use, reason));
        }
    }

    /// With no consumer at all the disk is reported as not in use.
    #[test]
    fn inuse_false_without_consumers(in_use in any::<bool>(), reason_idx in 0usize..4) {
        let reasons = [
            InUseReason::AttachedToVirtualMachine,
            InUseReason::UsedForImageCreation,
            InUseReason::UsedForDataExport,
            InUseReason::NotInUse,
        ];
        let decision = decide(Some((in_use, reasons[reason_idx].clone())), &UsageFacts::default());
        prop_assert_eq!(
            decision,
            InUseDecision::Set { in_use: false, reason: InUseReason::NotInUse, stop: false }
        );
    }

    /// Backoff stays within its bounds and never shrinks.
    #[test]
    fn backoff_bounded_and_monotone(attempt in 1u32..64) {
        let delay = exponential_backoff(BACKOFF_BASE, BACKOFF_MAX, attempt);
        prop_assert!(delay >= BACKOFF_BASE);
        prop_assert!(delay <= BACKOFF_MAX);
        prop_assert!(exponential_backoff(BACKOFF_BASE, BACKOFF_MAX, attempt + 1) >= delay);
    }

    /// The next relocation is due within the backoff window after the last failure.
    #[test]
    fn next_attempt_within_window(
        phases in prop::collection::vec(any_finished_phase(), 1..12)
    ) {
        let start = Timestamp::from_second(1_700_000_000).unwrap();
        let operations: Vec<_> = phases
            .iter()
            .enumerate()
            .map(|(i, phase)| {
                let mut op = generate_volume_migration("vms", "vm");
                op.metadata.name = Some(format!("op-{i}"));
                let created = start + SignedDuration::from_secs(60 * i as i64);
                op.metadata.creation_timestamp = Some(Time(created));
                op.status = Some(VirtualMachineOperationStatus { phase: *phase });
                op
            })
            .collect();

        let next = next_attempt_at("vm", None, &operations);
        let last = phases.len() - 1;
        if phases[last] == OperationPhase::Completed {
            prop_assert!(next.is_none());
        } else {
            let last_failure = start + SignedDuration::from_secs(60 * last as i64);
            let wait = next.unwrap().duration_since(last_failure);
            let wait = Duration::try_from(wait).unwrap();
            prop_assert!(wait >= BACKOFF_BASE);
            prop_assert!(wait <= BACKOFF_MAX);
        }
    }

    /// Normalizing a message twice changes nothing.
    #[test]
    fn message_normalization_idempotent(text in "[a-zA-Z ,.:]{0,40}") {
        let once = status::message(&text);
        prop_assert_eq!(status::message(&once), once.clone());
        if !once.is_empty() {
            prop_assert!(once.ends_with('.'));
        }
    }
}
