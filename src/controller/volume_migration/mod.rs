//! Volume migration orchestrator.
//!
//! A second controller over VirtualDisks, decoupled from the disk chain.
//! Once the disk chain reports Migrating=True, it asks the mounted machine
//! to relocate (so the new claim binds next to it) and retries failed
//! relocations with backoff; when the storage class change is undone, it
//! withdraws the pending relocation. All state it acts on lives in the
//! cluster: the disk status and the machine's operations.

pub mod cancel;
pub mod trigger;

pub use cancel::CancelHandler;
pub use trigger::TriggerHandler;

use std::sync::Arc;
use std::time::Instant;

use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, warn};

use crate::controller::context::{Context, disk_key};
use crate::controller::error::{Error, Result};
use crate::controller::handler::Outcome;
use crate::controller::reconciler::{HandlerChain, to_action};
use crate::crd::VirtualDisk;

/// Controller label of the orchestrator's metrics.
pub const CONTROLLER_NAME: &str = "volume-migration";

pub struct VolumeMigrationReconciler {
    pub ctx: Arc<Context>,
    chain: HandlerChain,
}

impl VolumeMigrationReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        let chain = HandlerChain::from_handlers(vec![
            Box::new(CancelHandler::new(ctx.clone())),
            Box::new(TriggerHandler::new(ctx.clone())),
        ]);
        Self { ctx, chain }
    }

    /// One pass. The disk is only read: nothing is written back to it.
    pub async fn reconcile_pass(&self, namespace: &str, name: &str) -> Result<Option<Outcome>> {
        if !self.ctx.config.volume_migration_enabled {
            return Ok(None);
        }
        let Some(mut disk) = self.ctx.store.get_disk(namespace, name).await? else {
            return Ok(None);
        };
        if disk.is_deleting() {
            return Ok(None);
        }
        self.chain.run(&mut disk).await.map(Some)
    }
}

/// Failures are counted apart from the disk controller's.
fn failure_key(namespace: &str, name: &str) -> String {
    format!("{CONTROLLER_NAME}:{}", disk_key(namespace, name))
}

/// Reconcile a VirtualDisk for volume migration
pub async fn reconcile(
    disk: Arc<VirtualDisk>,
    reconciler: Arc<VolumeMigrationReconciler>,
) -> Result<Action> {
    let start_time = Instant::now();
    let name = disk.name_any();
    let namespace = disk.namespace().unwrap_or_default();
    debug!(name = %name, namespace = %namespace, "Reconciling volume migration");

    let outcome = reconciler.reconcile_pass(&namespace, &name).await?;
    let ctx = &reconciler.ctx;
    ctx.reset_failures(&failure_key(&namespace, &name));
    if let Some(health) = &ctx.health_state {
        health.metrics.record_reconcile(
            CONTROLLER_NAME,
            &namespace,
            start_time.elapsed().as_secs_f64(),
        );
    }

    Ok(match outcome {
        Some(Outcome::Continue) | None => Action::await_change(),
        Some(outcome) => to_action(outcome),
    })
}

/// Error policy for the orchestrator
pub fn error_policy(
    disk: Arc<VirtualDisk>,
    error: &Error,
    reconciler: Arc<VolumeMigrationReconciler>,
) -> Action {
    let name = disk.name_any();
    let namespace = disk.namespace().unwrap_or_default();
    let ctx = &reconciler.ctx;

    if let Some(health) = &ctx.health_state {
        health.metrics.record_error(CONTROLLER_NAME, &namespace);
    }
    if error.is_not_found() {
        return Action::await_change();
    }
    let attempt = ctx.record_failure(&failure_key(&namespace, &name));
    let backoff = error.requeue_after(attempt);
    warn!(name = %name, namespace = %namespace, error = %error, attempt, "Volume migration pass failed");
    Action::requeue(backoff)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::OperatorConfig;
    use crate::controller::context::RecordingPublisher;
    use crate::crd::{
        AttachedVirtualMachine, Condition, ConditionStatus, MachinePhase, MigrationState,
        OperationPhase, VirtualDiskSpec, VirtualMachine, VirtualMachineOperationStatus,
        VirtualMachineSpec, VirtualMachineStatus,
    };
    use crate::resources::operation::VOLUME_MIGRATION_PREFIX;
    use crate::store::MemoryStore;

    fn migrating_disk() -> VirtualDisk {
        let mut disk = VirtualDisk::new("root", VirtualDiskSpec::default());
        disk.metadata.namespace = Some("vms".to_string());
        disk.spec.persistent_volume_claim.storage_class_name = Some("sc-b".to_string());
        let status = disk.status_mut();
        status.storage_class_name = Some("sc-a".to_string());
        status.attached_to = vec![AttachedVirtualMachine {
            name: "vm".to_string(),
            mounted: true,
        }];
        status.migration_state = MigrationState {
            source_pvc: "vd-root-1".to_string(),
            target_pvc: "vd-root-2".to_string(),
            start_timestamp: Some(jiff::Timestamp::now().to_string()),
            target_storage_class: Some("sc-b".to_string()),
            ..Default::default()
        };
        status.conditions = vec![Condition::new(
            "Migrating",
            ConditionStatus::True,
            "InProgress",
            "",
            Some(1),
        )];
        disk
    }

    fn setup(enabled: bool) -> (Arc<MemoryStore>, VolumeMigrationReconciler) {
        let store = Arc::new(MemoryStore::new());
        store.insert_disk(migrating_disk());
        let mut vm = VirtualMachine::new("vm", VirtualMachineSpec::default());
        vm.metadata.namespace = Some("vms".to_string());
        vm.status = Some(VirtualMachineStatus {
            phase: Some(MachinePhase::Running),
            ..Default::default()
        });
        store.insert_machine(vm);
        let ctx = Arc::new(Context::new(
            store.clone(),
            Arc::new(RecordingPublisher::new()),
            OperatorConfig {
                volume_migration_enabled: enabled,
                ..Default::default()
            },
            None,
        ));
        (store, VolumeMigrationReconciler::new(ctx))
    }

    #[tokio::test]
    async fn test_disabled_orchestrator_does_nothing() {
        let (store, reconciler) = setup(false);
        assert_eq!(reconciler.reconcile_pass("vms", "root").await.unwrap(), None);
        assert!(store.operations("vms").is_empty());
    }

    #[tokio::test]
    async fn test_trigger_creates_single_relocation() {
        let (store, reconciler) = setup(true);
        let outcome = reconciler.reconcile_pass("vms", "root").await.unwrap();
        assert_eq!(outcome, Some(Outcome::RequeueAfter(trigger::IN_FLIGHT_POLL)));
        reconciler.reconcile_pass("vms", "root").await.unwrap();

        let ops = store.operations("vms");
        assert_eq!(ops.len(), 1);
        assert!(ops[0].name_any().starts_with(VOLUME_MIGRATION_PREFIX));
        assert_eq!(ops[0].spec.virtual_machine_name, "vm");
    }

    #[tokio::test]
    async fn test_failed_relocation_backs_off() {
        let (store, reconciler) = setup(true);
        reconciler.reconcile_pass("vms", "root").await.unwrap();
        let op = store.operations("vms")[0].name_any();
        store.update_operation("vms", &op, |op| {
            op.status = Some(VirtualMachineOperationStatus {
                phase: OperationPhase::Failed,
            });
        });

        let outcome = reconciler.reconcile_pass("vms", "root").await.unwrap();
        assert!(matches!(outcome, Some(Outcome::RequeueAfter(d)) if d <= trigger::BACKOFF_BASE));
        assert_eq!(store.operations("vms").len(), 1);
    }

    #[tokio::test]
    async fn test_undone_class_change_cancels_relocation() {
        let (store, reconciler) = setup(true);
        reconciler.reconcile_pass("vms", "root").await.unwrap();
        assert_eq!(store.operations("vms").len(), 1);

        store.update_disk_spec("vms", "root", |disk| {
            disk.spec.persistent_volume_claim.storage_class_name = Some("sc-a".to_string());
        });
        reconciler.reconcile_pass("vms", "root").await.unwrap();
        assert!(store.operations("vms").is_empty());
    }
}
