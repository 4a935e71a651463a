//! Storage class migration across whole passes of both controllers.

use jiff::Timestamp;
use vdisk_operator::controller::handler::Outcome;
use vdisk_operator::controller::volume_migration::trigger::IN_FLIGHT_POLL;
use vdisk_operator::crd::{
    ConditionType, MachineMigrationResult, MachineMigrationState, MigrationResult,
};

use crate::harness::{DISK, Harness, NAMESPACE, status_is};

fn change_class(h: &Harness, class: &str) {
    h.store.update_disk_spec(NAMESPACE, DISK, |disk| {
        disk.spec.persistent_volume_claim.storage_class_name = Some(class.to_string());
    });
}

fn finish_machine_migration(h: &Harness, result: MachineMigrationResult) {
    let now = Timestamp::now().to_string();
    h.store.update_machine(NAMESPACE, "vm", |vm| {
        if let Some(status) = vm.status.as_mut() {
            status.migration_state = Some(MachineMigrationState {
                start_timestamp: Some(now.clone()),
                end_timestamp: Some(now),
                result: Some(result),
            });
        }
    });
}

/// A Ready disk on sc-a whose declaration just moved to sc-b, migrating.
async fn migrating() -> (Harness, String) {
    let h = Harness::with_migration();
    h.storage_class("sc-a", true).storage_class("sc-b", true);
    let source = h.ready_attached_disk("sc-a").await;
    change_class(&h, "sc-b");
    h.settle().await;
    (h, source)
}

#[tokio::test]
async fn test_class_change_starts_migration() {
    let (h, source) = migrating().await;

    let targets = h.other_claims(&source);
    assert_eq!(targets.len(), 1);
    let target = h.claim(&targets[0]).unwrap();
    let spec = target.spec.as_ref().unwrap();
    assert_eq!(spec.storage_class_name.as_deref(), Some("sc-b"));

    let disk = h.disk();
    assert!(disk.is_migrating());
    let state = disk.migration_state().unwrap();
    assert_eq!(state.source_pvc, source);
    assert_eq!(state.target_pvc, targets[0]);
    assert_eq!(disk.tracked_claim_name(), Some(targets[0].as_str()));
    assert_eq!(h.state_of(ConditionType::Migrating), status_is("True", "InProgress"));
    assert!(h.events.reasons().iter().any(|r| r == "Migrating"));
}

#[tokio::test]
async fn test_repeated_passes_keep_single_target() {
    let (h, source) = migrating().await;
    for _ in 0..3 {
        h.pass().await;
    }
    assert_eq!(h.other_claims(&source).len(), 1);
}

#[tokio::test]
async fn test_failed_relocation_reverts() {
    let (h, source) = migrating().await;
    let target = h.other_claims(&source).remove(0);

    finish_machine_migration(&h, MachineMigrationResult::Failed);
    h.pass().await;

    let disk = h.disk();
    let state = disk.migration_state().unwrap();
    assert_eq!(state.result, Some(MigrationResult::Failed));
    assert!(state.end_timestamp.is_some());
    assert!(!disk.is_migrating());
    assert!(h.condition(ConditionType::Migrating).is_none());
    assert_eq!(disk.tracked_claim_name(), Some(source.as_str()));
    assert!(h.claim_removed(&target));
    assert!(!h.claim_removed(&source));
}

#[tokio::test]
async fn test_successful_relocation_completes() {
    let (h, source) = migrating().await;
    let target = h.other_claims(&source).remove(0);

    h.bind_claim(&target, "10Gi");
    finish_machine_migration(&h, MachineMigrationResult::Succeeded);
    h.pass().await;

    let disk = h.disk();
    let state = disk.migration_state().unwrap();
    assert_eq!(state.result, Some(MigrationResult::Succeeded));
    assert_eq!(disk.tracked_claim_name(), Some(target.as_str()));
    assert!(h.condition(ConditionType::Migrating).is_none());
    assert!(h.claim_removed(&source));

    // Replaying the pass leaves everything as it is.
    h.pass().await;
    let replayed = h.disk();
    assert_eq!(replayed.migration_state(), disk.migration_state());
    assert_eq!(replayed.tracked_claim_name(), Some(target.as_str()));
    assert_eq!(
        replayed.status.as_ref().unwrap().storage_class_name.as_deref(),
        Some("sc-b")
    );
}

#[tokio::test]
async fn test_immediate_class_is_a_terminal_failure() {
    let h = Harness::with_migration();
    h.storage_class("sc-a", true).storage_class("sc-fast", false);
    let source = h.ready_attached_disk("sc-a").await;

    change_class(&h, "sc-fast");
    h.settle().await;
    h.settle().await;

    let disk = h.disk();
    let state = disk.migration_state().unwrap();
    assert_eq!(state.result, Some(MigrationResult::Failed));
    assert!(state.message.contains("WaitForFirstConsumer"));
    assert!(h.other_claims(&source).is_empty());
    assert!(!disk.is_migrating());
}

#[tokio::test]
async fn test_orchestrator_requests_relocation() {
    let (h, _) = migrating().await;

    let outcome = h.orchestrate().await;
    assert_eq!(outcome, Some(Outcome::RequeueAfter(IN_FLIGHT_POLL)));
    let ops = h.store.operations(NAMESPACE);
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].spec.virtual_machine_name, "vm");

    // While the relocation runs nothing new is requested.
    h.orchestrate().await;
    assert_eq!(h.store.operations(NAMESPACE).len(), 1);
}

#[tokio::test]
async fn test_undone_class_change_cancels_and_reverts() {
    let (h, source) = migrating().await;
    h.orchestrate().await;
    assert_eq!(h.store.operations(NAMESPACE).len(), 1);

    change_class(&h, "sc-a");
    h.orchestrate().await;
    assert!(h.store.operations(NAMESPACE).is_empty());

    h.pass().await;
    let disk = h.disk();
    assert!(!disk.is_migrating());
    assert_eq!(disk.tracked_claim_name(), Some(source.as_str()));
    assert!(h.other_claims(&source).iter().all(|c| h.claim_removed(c)));
}

#[tokio::test]
async fn test_disabled_feature_ignores_class_change() {
    let h = Harness::new(Default::default());
    h.storage_class("sc-a", true).storage_class("sc-b", true);
    let source = h.ready_attached_disk("sc-a").await;

    change_class(&h, "sc-b");
    h.settle().await;

    assert!(!h.disk().is_migrating());
    assert!(h.other_claims(&source).is_empty());
    assert_eq!(h.orchestrate().await, None);
}
