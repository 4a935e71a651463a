//! Asks the mounted machine to relocate once its disk is migrating.
//!
//! The retry backoff is derived from the machine's relocation history on
//! every pass: the trailing run of failed relocations since the machine was
//! created decides how long to wait after the last one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jiff::{SignedDuration, Timestamp};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::attachment::mounted_machine;
use crate::controller::context::Context;
use crate::controller::error::{Result, exponential_backoff};
use crate::controller::handler::{Handler, Outcome};
use crate::controller::status;
use crate::controller::volume_migration::cancel::is_unwanted;
use crate::crd::{
    ConditionType, MachinePhase, OperationPhase, VirtualDisk, VirtualMachineOperation,
};
use crate::resources::operation::{generate_volume_migration, is_volume_migration};

/// Delay after the first failed relocation.
pub const BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Longest delay between relocations.
pub const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// How often an in-flight relocation is looked at again.
pub const IN_FLIGHT_POLL: Duration = Duration::from_secs(10);

/// Relocations issued for `machine` since it was created, oldest first.
fn history<'a>(
    machine: &str,
    machine_created: Option<Timestamp>,
    operations: &'a [VirtualMachineOperation],
) -> Vec<&'a VirtualMachineOperation> {
    let mut ops: Vec<&VirtualMachineOperation> = operations
        .iter()
        .filter(|op| op.spec.virtual_machine_name == machine && is_volume_migration(op))
        .filter(|op| match (machine_created, op.created_at()) {
            (Some(created), Some(at)) => at >= created,
            _ => true,
        })
        .collect();
    ops.sort_by_key(|op| op.created_at());
    ops
}

/// Earliest time the next relocation of `machine` may be created.
///
/// `None` when the last finished relocation did not fail.
pub fn next_attempt_at(
    machine: &str,
    machine_created: Option<Timestamp>,
    operations: &[VirtualMachineOperation],
) -> Option<Timestamp> {
    let finished: Vec<&VirtualMachineOperation> = history(machine, machine_created, operations)
        .into_iter()
        .filter(|op| op.is_finished())
        .collect();
    let failures = finished
        .iter()
        .rev()
        .take_while(|op| op.phase() == OperationPhase::Failed)
        .count();
    if failures == 0 {
        return None;
    }

    let last_failure = finished.last()?.created_at()?;
    let attempt = u32::try_from(failures).unwrap_or(u32::MAX);
    let delay = exponential_backoff(BACKOFF_BASE, BACKOFF_MAX, attempt);
    let delay = SignedDuration::try_from(delay).unwrap_or(SignedDuration::ZERO);
    last_failure.checked_add(delay).ok()
}

/// Time left until `at`, zero once it has passed.
fn remaining(at: Timestamp, now: Timestamp) -> Duration {
    let left = at.duration_since(now);
    if left.is_positive() {
        Duration::try_from(left).unwrap_or_default()
    } else {
        Duration::ZERO
    }
}

pub struct TriggerHandler {
    ctx: Arc<Context>,
}

impl TriggerHandler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for TriggerHandler {
    fn name(&self) -> &'static str {
        "trigger"
    }

    async fn handle(&self, disk: &mut VirtualDisk) -> Result<Outcome> {
        if !disk.is_migrating()
            || !status::is_true(disk.conditions(), ConditionType::Migrating)
            || is_unwanted(disk)
        {
            return Ok(Outcome::Continue);
        }
        let Some(machine_name) = disk
            .status
            .as_ref()
            .and_then(|s| mounted_machine(&s.attached_to))
            .map(String::from)
        else {
            return Ok(Outcome::Continue);
        };

        let name = disk.name_any();
        let namespace = disk.namespace().unwrap_or_default();
        let store = self.ctx.store.as_ref();
        let Some(machine) = store.get_virtual_machine(&namespace, &machine_name).await? else {
            return Ok(Outcome::Continue);
        };
        if machine.phase() != Some(MachinePhase::Running) {
            return Ok(Outcome::Continue);
        }

        let operations = store.list_operations(&namespace).await?;
        let relocating = operations.iter().any(|op| {
            op.spec.virtual_machine_name == machine_name && op.is_migration() && op.is_in_flight()
        });
        if relocating {
            debug!(name = %name, machine = %machine_name, "Relocation in flight");
            return Ok(Outcome::RequeueAfter(IN_FLIGHT_POLL));
        }

        // A relocation that already succeeded for this migration is left to
        // the disk controller to complete.
        let started = disk.migration_state().and_then(|s| s.started_at());
        let machine_created = machine.metadata.creation_timestamp.as_ref().map(|t| t.0);
        let relocated = history(&machine_name, machine_created, &operations)
            .iter()
            .any(|op| {
                op.phase() == OperationPhase::Completed
                    && matches!((op.created_at(), started), (Some(at), Some(start)) if at >= start)
            });
        if relocated {
            return Ok(Outcome::Continue);
        }

        if let Some(at) = next_attempt_at(&machine_name, machine_created, &operations) {
            let wait = remaining(at, Timestamp::now());
            if !wait.is_zero() {
                info!(
                    name = %name,
                    machine = %machine_name,
                    wait_secs = wait.as_secs(),
                    "Backing off before the next relocation"
                );
                return Ok(Outcome::RequeueAfter(wait));
            }
        }

        let operation = generate_volume_migration(&namespace, &machine_name);
        store.create_operation(&operation).await?;
        info!(name = %name, machine = %machine_name, "Relocation requested");
        self.ctx
            .publish_normal_event(
                disk,
                "VolumeMigration",
                "Evict",
                Some(format!(
                    "Relocating virtual machine {machine_name} to move its disk"
                )),
            )
            .await;
        Ok(Outcome::RequeueAfter(IN_FLIGHT_POLL))
    }
}
