//! Typed views of the virtual machine resources a disk interacts with.
//!
//! Only the fields the disk controller reads are modelled; unknown fields are
//! ignored on deserialization.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::conditions::Condition;

/// A virtual machine, the primary consumer of a disk.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "virtualization.vdisk.io",
    version = "v1alpha1",
    kind = "VirtualMachine",
    plural = "virtualmachines",
    shortname = "vm",
    status = "VirtualMachineStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    #[serde(default)]
    pub block_device_refs: Vec<BlockDeviceRef>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceRef {
    pub kind: BlockDeviceKind,
    pub name: String,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum BlockDeviceKind {
    #[default]
    VirtualDisk,
    VirtualImage,
    ClusterVirtualImage,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Empty until the machine controller has seen the machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<MachinePhase>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Block devices the machine actually uses.
    #[serde(default)]
    pub block_device_refs: Vec<BlockDeviceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_state: Option<MachineMigrationState>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum MachinePhase {
    Pending,
    Starting,
    Running,
    Migrating,
    Pause,
    Stopping,
    Stopped,
    Terminating,
    Degraded,
}

/// Outcome of the machine's most recent live migration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineMigrationState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<MachineMigrationResult>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum MachineMigrationResult {
    Succeeded,
    Failed,
}

/// Machine condition types read by the disk controller.
pub mod machine_conditions {
    pub const RUNNING: &str = "Running";
    pub const MIGRATING: &str = "Migrating";
    pub const MIGRATABLE: &str = "Migratable";
    pub const IP_ADDRESS_READY: &str = "IPAddressReady";
    pub const CLASS_READY: &str = "ClassReady";
    pub const PROVISIONING_READY: &str = "ProvisioningReady";

    /// Migrating reason: the migration waits to be scheduled.
    pub const REASON_MIGRATION_PENDING: &str = "Pending";
    /// Migrating reason: the last migration ended with an error.
    pub const REASON_LAST_MIGRATION_FINISHED_WITH_ERROR: &str = "LastMigrationFinishedWithError";
    /// Migratable reason: the disks must move before the machine can.
    pub const REASON_DISKS_SHOULD_BE_MIGRATING: &str = "DisksShouldBeMigrating";
}

impl VirtualMachine {
    pub fn phase(&self) -> Option<MachinePhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.r#type == condition_type))
    }

    /// The machine lists the disk among the block devices it uses.
    pub fn uses_disk(&self, disk_name: &str) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.block_device_refs
                .iter()
                .any(|r| r.kind == BlockDeviceKind::VirtualDisk && r.name == disk_name)
        })
    }

    /// Names of the disks the machine references in spec or status.
    pub fn referenced_disks(&self) -> Vec<String> {
        let from_status = self
            .status
            .iter()
            .flat_map(|s| s.block_device_refs.iter());
        let mut names: Vec<String> = self
            .spec
            .block_device_refs
            .iter()
            .chain(from_status)
            .filter(|r| r.kind == BlockDeviceKind::VirtualDisk)
            .map(|r| r.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// An operation requested on a virtual machine (start, stop, evict, ...).
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "virtualization.vdisk.io",
    version = "v1alpha1",
    kind = "VirtualMachineOperation",
    plural = "virtualmachineoperations",
    shortname = "vmop",
    status = "VirtualMachineOperationStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineOperationSpec {
    pub r#type: OperationType,
    pub virtual_machine_name: String,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum OperationType {
    Start,
    Stop,
    Restart,
    /// Live-migrate the machine to another node.
    #[default]
    Evict,
    Migrate,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineOperationStatus {
    #[serde(default)]
    pub phase: OperationPhase,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum OperationPhase {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Terminating,
}

impl VirtualMachineOperation {
    pub fn phase(&self) -> OperationPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn is_migration(&self) -> bool {
        matches!(self.spec.r#type, OperationType::Evict | OperationType::Migrate)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(
            self.phase(),
            OperationPhase::Pending | OperationPhase::InProgress
        )
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.phase(),
            OperationPhase::Completed | OperationPhase::Failed
        )
    }

    pub fn created_at(&self) -> Option<jiff::Timestamp> {
        self.metadata.creation_timestamp.as_ref().map(|t| t.0)
    }
}
