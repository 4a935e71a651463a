//! Volume migration decision.
//!
//! The action is computed fresh on every pass from the disk and the machine
//! it is mounted to; nothing about the decision is stored besides the
//! disk's `migrationState`.

use std::fmt;

use jiff::{SignedDuration, Timestamp};

use crate::controller::attachment::mounted_machine;
use crate::controller::status;
use crate::crd::{
    ConditionType, InUseReason, MachineMigrationResult, MigrationResult, MigrationState,
    VirtualDisk, VirtualMachine, machine_conditions, parse_timestamp,
};

/// How long a migration may run without its relocation ever being requested.
///
/// Longer than the orchestrator's retry backoff, so a delayed request is not
/// mistaken for a missing one.
pub const RELOCATION_GRACE: SignedDuration = SignedDuration::from_secs(600);

/// What the migration handler does this pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Nothing to start or finish.
    None,
    /// Start moving the disk to a new claim.
    Migrate,
    /// A migration is in progress and still healthy: refresh its condition.
    Sync,
    /// Abandon the migration and go back to the source claim.
    Revert,
    /// The machine moved over: drop the source claim.
    Complete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::None => "none",
            Action::Migrate => "migrate",
            Action::Sync => "sync",
            Action::Revert => "revert",
            Action::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Observations about the mounted machine needed for the decision.
#[derive(Clone, Copy, Debug, Default)]
pub struct MachineFacts<'a> {
    /// The mounted machine, `None` when it no longer exists.
    pub machine: Option<&'a VirtualMachine>,
    /// A relocation operation of the machine is pending or running.
    pub relocation_in_flight: bool,
    /// A relocation requested since the migration started has finished.
    pub relocation_finished: bool,
    /// The tracked claim can be shared between nodes.
    pub claim_shared: bool,
    /// When the observations were made.
    pub now: Timestamp,
}

/// The migration was rejected before it started.
///
/// Such a failure is not retried until the target storage class changes.
pub fn is_terminal_failure(state: &MigrationState) -> bool {
    state.result == Some(MigrationResult::Failed)
        && state.source_pvc.is_empty()
        && state.end_timestamp.is_some()
}

/// Storage class a migration started now would move the disk to.
pub fn target_storage_class(disk: &VirtualDisk) -> Option<&str> {
    disk.declared_storage_class()
        .or_else(|| disk.provisioned_storage_class())
}

fn in_use_reason(disk: &VirtualDisk) -> Option<InUseReason> {
    status::get(disk.conditions(), ConditionType::InUse).map(|c| InUseReason::parse(&c.reason))
}

fn is_running(machine: &VirtualMachine) -> bool {
    machine
        .condition(machine_conditions::RUNNING)
        .is_some_and(|c| c.is_true())
}

/// Result of the machine's own migration, if it ended after `since`.
fn machine_migration_result(
    machine: &VirtualMachine,
    since: Timestamp,
) -> Option<MachineMigrationResult> {
    let state = machine.status.as_ref()?.migration_state.as_ref()?;
    let ended = state.end_timestamp.as_deref().and_then(parse_timestamp)?;
    (ended >= since).then_some(state.result).flatten()
}

fn failed_since(machine: &VirtualMachine, since: Timestamp) -> bool {
    machine
        .condition(machine_conditions::MIGRATING)
        .filter(|c| c.reason == machine_conditions::REASON_LAST_MIGRATION_FINISHED_WITH_ERROR)
        .is_some_and(|c| parse_timestamp(&c.last_transition_time).is_some_and(|at| at >= since))
}

fn decide_in_progress(disk: &VirtualDisk, facts: &MachineFacts<'_>) -> Action {
    let Some(machine) = facts.machine else {
        return Action::Revert;
    };
    if !is_running(machine) {
        return Action::Revert;
    }
    let Some(state) = disk.migration_state() else {
        return Action::Sync;
    };
    let start = state.started_at();
    let started = start.unwrap_or(Timestamp::UNIX_EPOCH);

    match machine_migration_result(machine, started) {
        Some(MachineMigrationResult::Succeeded) => return Action::Complete,
        Some(MachineMigrationResult::Failed) => return Action::Revert,
        None => {}
    }
    if failed_since(machine, started) {
        return Action::Revert;
    }

    let retargeted = match (disk.declared_storage_class(), state.target_storage_class.as_deref()) {
        (Some(declared), Some(target)) => declared != target,
        _ => false,
    };
    if facts.relocation_in_flight {
        return Action::Sync;
    }
    if retargeted || facts.relocation_finished {
        return Action::Revert;
    }
    // Nothing ever came to move the machine.
    if start.is_some_and(|start| facts.now.duration_since(start) > RELOCATION_GRACE) {
        return Action::Revert;
    }
    Action::Sync
}

fn should_start(disk: &VirtualDisk, machine: &VirtualMachine, facts: &MachineFacts<'_>) -> bool {
    if !status::is_true(disk.conditions(), ConditionType::Ready) {
        return false;
    }
    if let Some(state) = disk.migration_state()
        && is_terminal_failure(state)
        && state.target_storage_class.as_deref() == target_storage_class(disk)
    {
        return false;
    }
    if disk.storage_class_changed() {
        return true;
    }

    let pending = machine
        .condition(machine_conditions::MIGRATING)
        .is_some_and(|c| c.reason == machine_conditions::REASON_MIGRATION_PENDING);
    let disks_block = machine
        .condition(machine_conditions::MIGRATABLE)
        .is_some_and(|c| c.reason == machine_conditions::REASON_DISKS_SHOULD_BE_MIGRATING);
    pending && disks_block && !facts.claim_shared
}

/// Decide the migration action of this pass.
pub fn decide(disk: &VirtualDisk, facts: &MachineFacts<'_>) -> Action {
    let migrating = disk.is_migrating();
    let attached = in_use_reason(disk) == Some(InUseReason::AttachedToVirtualMachine);
    let mounted = disk
        .status
        .as_ref()
        .and_then(|s| mounted_machine(&s.attached_to));

    if !attached || mounted.is_none() {
        return if migrating {
            Action::Revert
        } else {
            Action::None
        };
    }
    if migrating {
        return decide_in_progress(disk, facts);
    }
    match facts.machine {
        Some(machine) if should_start(disk, machine, facts) => Action::Migrate,
        _ => Action::None,
    }
}
