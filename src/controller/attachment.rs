//! Attachment tracking.
//!
//! Works out which consumers use a disk and which InUse reason the disk
//! should report. Everything here is pure; the InUse handler gathers the
//! facts from the store.
//!
//! The reported reason is sticky: while the consumer behind the current
//! reason still uses the disk, a higher priority consumer does not take
//! over. Moving to another reason always goes through `False` first.

use std::collections::BTreeMap;

use crate::crd::{
    AttachedVirtualMachine, Condition, InUseReason, MachinePhase, VirtualMachine,
    machine_conditions::{CLASS_READY, IP_ADDRESS_READY, PROVISIONING_READY},
};

/// Machine conditions that keep a pending machine from starting when False.
const START_GATES: [&str; 3] = [IP_ADDRESS_READY, CLASS_READY, PROVISIONING_READY];

/// Whether a machine referencing the disk actually uses it.
///
/// A stopped machine only counts while its runtime is still active.
pub fn machine_uses_disk(machine: &VirtualMachine, active_runtime: bool) -> bool {
    match machine.phase() {
        None => false,
        Some(MachinePhase::Pending) => START_GATES
            .iter()
            .all(|gate| !machine.condition(gate).is_some_and(Condition::is_false)),
        Some(MachinePhase::Stopped) => active_runtime,
        Some(_) => true,
    }
}

/// Name of the machine the disk is mounted to.
pub fn mounted_machine(attached: &[AttachedVirtualMachine]) -> Option<&str> {
    attached
        .iter()
        .find(|vm| vm.mounted)
        .map(|vm| vm.name.as_str())
}

/// Rebuild the attachment list from per-machine usage.
///
/// The machine currently mounted keeps the mount while it uses the disk;
/// otherwise the first using machine by name gets it.
pub fn attached_machines(
    current: &[AttachedVirtualMachine],
    usage: &BTreeMap<String, bool>,
) -> Vec<AttachedVirtualMachine> {
    let keep = mounted_machine(current)
        .filter(|name| usage.get(*name).copied().unwrap_or(false))
        .map(String::from);
    let mounted = keep.or_else(|| {
        usage
            .iter()
            .find(|(_, used)| **used)
            .map(|(name, _)| name.clone())
    });

    usage
        .keys()
        .map(|name| AttachedVirtualMachine {
            name: name.clone(),
            mounted: mounted.as_deref() == Some(name.as_str()),
        })
        .collect()
}

/// What currently uses the disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsageFacts {
    pub attached: bool,
    pub image_creation: bool,
    pub export: bool,
}

impl UsageFacts {
    pub fn uses(&self, reason: &InUseReason) -> bool {
        match reason {
            InUseReason::AttachedToVirtualMachine => self.attached,
            InUseReason::UsedForImageCreation => self.image_creation,
            InUseReason::UsedForDataExport => self.export,
            InUseReason::NotInUse | InUseReason::Retained(_) => false,
        }
    }

    /// Highest priority reason backed by a consumer.
    pub fn top(&self) -> Option<InUseReason> {
        InUseReason::IN_USE.into_iter().find(|r| self.uses(r))
    }
}

/// What the InUse handler writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InUseDecision {
    Set {
        in_use: bool,
        reason: InUseReason,
        /// Reconcile again right away to publish the next reason.
        stop: bool,
    },
    /// Leave the condition as it is.
    Retain,
}

/// Next InUse value given the current one and the observed usage.
pub fn decide(current: Option<(bool, InUseReason)>, facts: &UsageFacts) -> InUseDecision {
    let top = facts.top();
    match current {
        Some((true, reason)) if facts.uses(&reason) => InUseDecision::Set {
            in_use: true,
            reason,
            stop: false,
        },
        Some((_, InUseReason::Retained(_))) if top.is_none() => InUseDecision::Retain,
        Some((true, _)) => InUseDecision::Set {
            in_use: false,
            reason: InUseReason::NotInUse,
            stop: top.is_some(),
        },
        _ => match top {
            Some(reason) => InUseDecision::Set {
                in_use: true,
                reason,
                stop: false,
            },
            None => InUseDecision::Set {
                in_use: false,
                reason: InUseReason::NotInUse,
                stop: false,
            },
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::crd::{ConditionStatus, VirtualMachineSpec, VirtualMachineStatus};

    fn machine(phase: Option<MachinePhase>, conditions: Vec<Condition>) -> VirtualMachine {
        let mut vm = VirtualMachine::new("vm", VirtualMachineSpec::default());
        vm.status = Some(VirtualMachineStatus {
            phase,
            conditions,
            ..Default::default()
        });
        vm
    }

    fn set(in_use: bool, reason: InUseReason, stop: bool) -> InUseDecision {
        InUseDecision::Set {
            in_use,
            reason,
            stop,
        }
    }

    #[test]
    fn test_machine_usage_by_phase() {
        assert!(!machine_uses_disk(&machine(None, vec![]), true));
        assert!(machine_uses_disk(&machine(Some(MachinePhase::Running), vec![]), false));
        assert!(!machine_uses_disk(&machine(Some(MachinePhase::Stopped), vec![]), false));
        assert!(machine_uses_disk(&machine(Some(MachinePhase::Stopped), vec![]), true));
    }

    #[test]
    fn test_pending_machine_blocked_by_gate() {
        let blocked = Condition::new(CLASS_READY, ConditionStatus::False, "NotFound", "", None);
        assert!(!machine_uses_disk(
            &machine(Some(MachinePhase::Pending), vec![blocked]),
            false
        ));
        let unknown = Condition::new(CLASS_READY, ConditionStatus::Unknown, "", "", None);
        assert!(machine_uses_disk(
            &machine(Some(MachinePhase::Pending), vec![unknown]),
            false
        ));
    }

    #[test]
    fn test_attached_machines_keeps_current_mount() {
        let current = vec![AttachedVirtualMachine {
            name: "b".to_string(),
            mounted: true,
        }];
        let usage = BTreeMap::from([("a".to_string(), true), ("b".to_string(), true)]);
        let attached = attached_machines(&current, &usage);
        assert_eq!(mounted_machine(&attached), Some("b"));
        assert_eq!(attached.len(), 2);

        let usage = BTreeMap::from([("a".to_string(), true), ("b".to_string(), false)]);
        assert_eq!(mounted_machine(&attached_machines(&current, &usage)), Some("a"));

        let usage = BTreeMap::from([("a".to_string(), false)]);
        let attached = attached_machines(&current, &usage);
        assert_eq!(attached.len(), 1);
        assert_eq!(mounted_machine(&attached), None);
    }

    #[test]
    fn test_machine_outranks_image_creation() {
        let facts = UsageFacts {
            attached: true,
            image_creation: true,
            export: false,
        };
        assert_eq!(
            decide(None, &facts),
            set(true, InUseReason::AttachedToVirtualMachine, false)
        );
    }

    #[test]
    fn test_current_reason_is_sticky() {
        let facts = UsageFacts {
            attached: true,
            image_creation: true,
            export: false,
        };
        assert_eq!(
            decide(Some((true, InUseReason::UsedForImageCreation)), &facts),
            set(true, InUseReason::UsedForImageCreation, false)
        );
    }

    #[test]
    fn test_switch_goes_through_false() {
        let facts = UsageFacts {
            attached: true,
            ..Default::default()
        };
        assert_eq!(
            decide(Some((true, InUseReason::UsedForImageCreation)), &facts),
            set(false, InUseReason::NotInUse, true)
        );
        assert_eq!(
            decide(Some((false, InUseReason::NotInUse)), &facts),
            set(true, InUseReason::AttachedToVirtualMachine, false)
        );
    }

    #[test]
    fn test_released_disk_not_in_use() {
        assert_eq!(
            decide(
                Some((true, InUseReason::AttachedToVirtualMachine)),
                &UsageFacts::default()
            ),
            set(false, InUseReason::NotInUse, false)
        );
    }

    #[test]
    fn test_foreign_reason_retained_until_used() {
        let foreign = InUseReason::Retained("Unknown".to_string());
        assert_eq!(
            decide(Some((false, foreign.clone())), &UsageFacts::default()),
            InUseDecision::Retain
        );
        let facts = UsageFacts {
            export: true,
            ..Default::default()
        };
        assert_eq!(
            decide(Some((false, foreign)), &facts),
            set(true, InUseReason::UsedForDataExport, false)
        );
    }
}
