//! Storage class migration of an attached disk.
//!
//! A migration copies the disk onto a second claim on the target class
//! while the mounted machine relocates. The action of each pass comes from
//! [`crate::controller::migration::decide`]; this handler carries it out.
//! Nothing but `status.migrationState` and the tracked claim name records
//! where a migration stands.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::controller::attachment::mounted_machine;
use crate::controller::common::delete_claim;
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::handler::{Handler, Outcome};
use crate::controller::migration::{self, Action, MachineFacts, target_storage_class};
use crate::controller::status::{self, ConditionBuilder, ConditionScope};
use crate::controller::storage_class::{
    StorageClassService, is_deprecated, is_wait_for_first_consumer,
};
use crate::crd::{
    ConditionType, MigratingReason, MigrationResult, MigrationState, VirtualDisk, VirtualMachine,
};
use crate::quantity::parse_bytes;
use crate::resources::claim::{self, ACCESS_MODE_RWX, ClaimParams, generate_migration_target};
use crate::resources::is_owned_by;

/// Reason of every published migration event.
const EVENT_REASON: &str = "Migrating";

fn now() -> String {
    jiff::Timestamp::now().to_string()
}

pub struct MigrationHandler {
    ctx: Arc<Context>,
    classes: StorageClassService,
}

impl MigrationHandler {
    pub fn new(ctx: Arc<Context>) -> Self {
        let classes = StorageClassService::new(ctx.store.clone(), ctx.config.clone());
        Self { ctx, classes }
    }

    fn record_result(&self, result: &str) {
        if let Some(health) = &self.ctx.health_state {
            health.metrics.record_migration(result);
        }
    }

    /// Start a migration, or refuse with a condition or a terminal failure.
    pub async fn migrate(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<MigratingReason>,
    ) -> Result<Outcome> {
        if status::is_true(disk.conditions(), ConditionType::Resizing) {
            condition.set_false(
                MigratingReason::ResizingInProgress,
                "Migration is not possible while the virtual disk is being resized",
            );
            return Ok(Outcome::Continue);
        }
        if status::is_true(disk.conditions(), ConditionType::Snapshotting) {
            condition.set_false(
                MigratingReason::SnapshottingInProgress,
                "Migration is not possible while the virtual disk is being snapshotted",
            );
            return Ok(Outcome::Continue);
        }

        let name = disk.name_any();
        let namespace = disk.namespace().unwrap_or_default();

        let class_name = target_storage_class(disk).map(String::from);
        let class = match &class_name {
            Some(class_name) => self.classes.get(class_name).await?,
            None => None,
        };
        let (Some(class_name), Some(class)) = (class_name, class) else {
            condition.set_false(
                MigratingReason::StorageClassNotFound,
                "StorageClass not found, waiting for creation.",
            );
            return Ok(Outcome::Continue);
        };

        if !self.ctx.config.is_storage_class_allowed(&class_name) {
            let message = format!("StorageClass {class_name} is not allowed for use.");
            return self.fail(disk, condition, &class_name, message).await;
        }
        if is_deprecated(&class) {
            let message =
                format!("StorageClass {class_name} is deprecated, please use a different one.");
            return self.fail(disk, condition, &class_name, message).await;
        }
        if class.metadata.deletion_timestamp.is_some() {
            let message = format!("StorageClass {class_name} is terminating and cannot be used.");
            return self.fail(disk, condition, &class_name, message).await;
        }
        if !is_wait_for_first_consumer(&class) {
            let message = format!(
                "StorageClass {class_name} does not use the WaitForFirstConsumer volume binding mode required for migration."
            );
            return self.fail(disk, condition, &class_name, message).await;
        }

        let source_name = disk.tracked_claim_name().map(String::from);
        let source = match &source_name {
            Some(source_name) => self.ctx.store.get_claim(&namespace, source_name).await?,
            None => None,
        };
        let Some(source) = source else {
            return self
                .fail(
                    disk,
                    condition,
                    &class_name,
                    "Actual PersistentVolumeClaim is not found.".to_string(),
                )
                .await;
        };
        let size = match claim::capacity(&source) {
            Some(capacity) if parse_bytes(capacity).is_ok_and(|bytes| bytes > 0) => capacity.to_string(),
            _ => {
                let message = format!(
                    "Failed to determine the size of PersistentVolumeClaim {}.",
                    source.name_any()
                );
                return self.fail(disk, condition, &class_name, message).await;
            }
        };

        let target = match self.existing_target(disk, &source).await? {
            Some(target) => target,
            None => {
                let params = ClaimParams {
                    size,
                    storage_class: Some(class_name.clone()),
                    access_modes: claim::access_modes(&source),
                    volume_mode: claim::volume_mode(&source),
                };
                self.ctx
                    .store
                    .create_claim(&generate_migration_target(disk, &params))
                    .await?
            }
        };
        let source_name = source.name_any();
        let target_name = target.name_any();
        if target_name == source_name {
            return Err(Error::Bug(format!(
                "migration target of disk {name} is its source claim {source_name}"
            )));
        }

        info!(
            name = %name,
            source = %source_name,
            target = %target_name,
            storage_class = %class_name,
            "Starting storage class migration"
        );
        let status = disk.status_mut();
        status.migration_state = MigrationState {
            source_pvc: source_name,
            target_pvc: target_name.clone(),
            start_timestamp: Some(now()),
            target_storage_class: Some(class_name.clone()),
            ..Default::default()
        };
        status.target.persistent_volume_claim = target_name;
        self.ctx
            .publish_normal_event(
                disk,
                EVENT_REASON,
                "Migrate",
                Some(format!("Migration to StorageClass {class_name} started")),
            )
            .await;

        self.sync(disk, condition).await
    }

    /// The target claim a previous pass already created.
    async fn existing_target(
        &self,
        disk: &VirtualDisk,
        source: &PersistentVolumeClaim,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let namespace = disk.namespace().unwrap_or_default();
        let source_name = source.name_any();
        let mut candidates: Vec<PersistentVolumeClaim> = self
            .ctx
            .store
            .list_claims(&namespace)
            .await?
            .into_iter()
            .filter(|pvc| {
                is_owned_by(pvc.owner_references(), disk)
                    && pvc.name_any() != source_name
                    && !claim::is_terminating(pvc)
            })
            .collect();

        if candidates.len() > 1 {
            let names: Vec<String> = candidates.iter().map(ResourceExt::name_any).collect();
            return Err(Error::Bug(format!(
                "disk {} owns {} migration target claims: {}",
                disk.name_any(),
                candidates.len(),
                names.join(", ")
            )));
        }
        Ok(candidates.pop())
    }

    /// Reject the migration until the target class changes.
    async fn fail(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<MigratingReason>,
        class_name: &str,
        message: String,
    ) -> Result<Outcome> {
        warn!(name = %disk.name_any(), storage_class = %class_name, message = %message, "Migration rejected");
        let at = now();
        disk.status_mut().migration_state = MigrationState {
            start_timestamp: Some(at.clone()),
            end_timestamp: Some(at),
            result: Some(MigrationResult::Failed),
            message: message.clone(),
            target_storage_class: Some(class_name.to_string()),
            ..Default::default()
        };
        condition.remove();
        self.ctx
            .publish_warning_event(disk, EVENT_REASON, "Migrate", Some(message))
            .await;
        self.record_result("failed");
        Ok(Outcome::Continue)
    }

    /// Refresh the condition of a migration in progress from its target claim.
    async fn sync(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<MigratingReason>,
    ) -> Result<Outcome> {
        let namespace = disk.namespace().unwrap_or_default();
        let target_name = disk
            .migration_state()
            .map(|s| s.target_pvc.clone())
            .unwrap_or_default();
        let target = if target_name.is_empty() {
            None
        } else {
            self.ctx.store.get_claim(&namespace, &target_name).await?
        };

        let Some(target) = target else {
            condition.set_false(
                MigratingReason::WaitForTargetReady,
                "Target persistent volume claim is not found.",
            );
            return Ok(Outcome::Continue);
        };

        if claim::is_bound(&target) {
            condition.set_true(
                MigratingReason::InProgress,
                "Target persistent volume claim is bound, waiting for the virtual machine to migrate.",
            );
            return Ok(Outcome::Continue);
        }
        if claim::is_pending(&target) {
            let class = match claim::storage_class(&target) {
                Some(class_name) => self.classes.get(class_name).await?,
                None => None,
            };
            if class.as_ref().is_some_and(is_wait_for_first_consumer) {
                condition.set_true(
                    MigratingReason::InProgress,
                    "Target persistent volume claim is waiting for the first consumer.",
                );
                return Ok(Outcome::Continue);
            }
        }
        condition.set_false(
            MigratingReason::WaitForTargetReady,
            format!(
                "Waiting for the target persistent volume claim {target_name} to be ready, current phase is {}",
                claim::claim_phase(&target)
            ),
        );
        Ok(Outcome::Continue)
    }

    /// Abandon the migration and go back to the source claim.
    pub async fn revert(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<MigratingReason>,
    ) -> Result<Outcome> {
        let Some(state) = disk.migration_state().cloned() else {
            return Ok(Outcome::Continue);
        };
        if state.result.is_some() && state.end_timestamp.is_some() {
            return Ok(Outcome::Continue);
        }
        let namespace = disk.namespace().unwrap_or_default();
        info!(name = %disk.name_any(), target = %state.target_pvc, "Reverting migration");

        if !state.target_pvc.is_empty() && state.target_pvc != state.source_pvc {
            delete_claim(self.ctx.store.as_ref(), &namespace, &state.target_pvc).await?;
        }
        self.finish_failed(disk, &state, "Migration reverted.");
        condition.remove();
        self.ctx
            .publish_warning_event(
                disk,
                EVENT_REASON,
                "Revert",
                Some("Migration reverted, the virtual disk stays on its source claim".to_string()),
            )
            .await;
        self.record_result("reverted");
        Ok(Outcome::Continue)
    }

    fn finish_failed(&self, disk: &mut VirtualDisk, state: &MigrationState, message: &str) {
        let status = disk.status_mut();
        if !state.source_pvc.is_empty() {
            status.target.persistent_volume_claim = state.source_pvc.clone();
        }
        let migration = &mut status.migration_state;
        migration.end_timestamp = Some(now());
        migration.result = Some(MigrationResult::Failed);
        migration.message = message.to_string();
    }

    /// The machine moved over: switch to the target claim for good.
    pub async fn complete(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<MigratingReason>,
    ) -> Result<Outcome> {
        let Some(state) = disk.migration_state().cloned() else {
            return Ok(Outcome::Continue);
        };
        if state.result.is_some() && state.end_timestamp.is_some() {
            return Ok(Outcome::Continue);
        }
        let name = disk.name_any();
        let namespace = disk.namespace().unwrap_or_default();
        let store = self.ctx.store.as_ref();

        let target = if state.target_pvc.is_empty() {
            None
        } else {
            store.get_claim(&namespace, &state.target_pvc).await?
        };
        let target = match target {
            Some(target) if claim::is_bound(&target) => target,
            other => {
                let message = if other.is_some() {
                    delete_claim(store, &namespace, &state.target_pvc).await?;
                    "Migration failed: target persistent volume claim is not bound."
                } else {
                    "Migration failed: target persistent volume claim is not found."
                };
                warn!(name = %name, target = %state.target_pvc, "Target claim not usable, migration failed");
                self.finish_failed(disk, &state, message);
                condition.remove();
                self.ctx
                    .publish_warning_event(disk, EVENT_REASON, "Complete", Some(message.to_string()))
                    .await;
                self.record_result("failed");
                return Ok(Outcome::Continue);
            }
        };

        if !state.source_pvc.is_empty() {
            delete_claim(store, &namespace, &state.source_pvc).await?;
        }
        let class_name = disk
            .declared_storage_class()
            .map(String::from)
            .or_else(|| claim::storage_class(&target).map(String::from));

        info!(name = %name, target = %state.target_pvc, "Migration completed");
        let status = disk.status_mut();
        status.target.persistent_volume_claim = state.target_pvc.clone();
        if class_name.is_some() {
            status.storage_class_name = class_name;
        }
        let migration = &mut status.migration_state;
        migration.end_timestamp = Some(now());
        migration.result = Some(MigrationResult::Succeeded);
        migration.message = "Migration completed.".to_string();
        condition.remove();

        self.ctx
            .publish_normal_event(
                disk,
                EVENT_REASON,
                "Complete",
                Some(format!("Migration to claim {} completed", state.target_pvc)),
            )
            .await;
        self.record_result("succeeded");
        Ok(Outcome::Continue)
    }

    /// Look up the mounted machine and its relocations.
    async fn observe(&self, disk: &VirtualDisk) -> Result<Observed> {
        let namespace = disk.namespace().unwrap_or_default();
        let mounted = disk
            .status
            .as_ref()
            .and_then(|s| mounted_machine(&s.attached_to))
            .map(String::from);

        let mut observed = Observed::default();
        if let Some(machine) = &mounted {
            observed.machine = self.ctx.store.get_virtual_machine(&namespace, machine).await?;
            let started = disk.migration_state().and_then(|m| m.started_at());
            for op in self.ctx.store.list_operations(&namespace).await? {
                if op.spec.virtual_machine_name != *machine || !op.is_migration() {
                    continue;
                }
                if op.is_in_flight() {
                    observed.relocation_in_flight = true;
                }
                let created = op.metadata.creation_timestamp.as_ref().map(|t| t.0);
                if op.is_finished()
                    && started.is_some_and(|start| created.is_some_and(|at| at >= start))
                {
                    observed.relocation_finished = true;
                }
            }
        }
        observed.claim_shared = match disk.tracked_claim_name() {
            Some(claim_name) => self
                .ctx
                .store
                .get_claim(&namespace, claim_name)
                .await?
                .is_some_and(|pvc| claim::access_modes(&pvc).iter().any(|m| m == ACCESS_MODE_RWX)),
            None => false,
        };
        Ok(observed)
    }
}

/// Owned observations behind [`MachineFacts`].
#[derive(Default)]
struct Observed {
    machine: Option<VirtualMachine>,
    relocation_in_flight: bool,
    relocation_finished: bool,
    claim_shared: bool,
}

#[async_trait]
impl ConditionScope for MigrationHandler {
    type Owned = MigratingReason;
    type Output = Result<Outcome>;

    async fn run(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<MigratingReason>,
    ) -> Result<Outcome> {
        if disk.is_deleting() || !self.ctx.config.volume_migration_enabled {
            return Ok(Outcome::Continue);
        }

        let observed = self.observe(disk).await?;
        let facts = MachineFacts {
            machine: observed.machine.as_ref(),
            relocation_in_flight: observed.relocation_in_flight,
            relocation_finished: observed.relocation_finished,
            claim_shared: observed.claim_shared,
            now: jiff::Timestamp::now(),
        };
        let action = migration::decide(disk, &facts);
        debug!(name = %disk.name_any(), action = %action, "Migration action");

        match action {
            Action::None => {
                // A class that went missing is moot once the change is undone.
                if status::reason::<MigratingReason>(disk.conditions())
                    == Some(MigratingReason::StorageClassNotFound)
                    && !disk.storage_class_changed()
                {
                    condition.remove();
                }
                Ok(Outcome::Continue)
            }
            Action::Migrate => self.migrate(disk, condition).await,
            Action::Sync => self.sync(disk, condition).await,
            Action::Revert => self.revert(disk, condition).await,
            Action::Complete => self.complete(disk, condition).await,
        }
    }
}

#[async_trait]
impl Handler for MigrationHandler {
    fn name(&self) -> &'static str {
        "migration"
    }

    async fn handle(&self, disk: &mut VirtualDisk) -> Result<Outcome> {
        status::scoped(self, disk).await
    }
}
