//! Condition record and the fixed condition vocabulary of a VirtualDisk.
//!
//! Every condition type has its own reason enum; a reason can only be
//! written under the type it belongs to (see [`Reason::CONDITION_TYPE`]).

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Condition describes one observed fact about a resource.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    #[serde(default)]
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    #[serde(default)]
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    #[serde(default)]
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition stamped with the current time.
    pub fn new(
        condition_type: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True.as_str()
    }

    pub fn is_false(&self) -> bool {
        self.status == ConditionStatus::False.as_str()
    }
}

/// Types of conditions for VirtualDisk.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConditionType {
    /// The declared data source exists and can be imported from.
    DatasourceReady,
    /// The disk is provisioned and usable.
    Ready,
    /// The underlying claim is being expanded.
    Resizing,
    /// A snapshot of the disk is being taken.
    Snapshotting,
    /// The storage class for the disk is usable.
    StorageClassReady,
    /// Some consumer currently uses the disk.
    InUse,
    /// Data is being moved to a claim on another storage class.
    Migrating,
    /// The import job was not blocked by a resource quota.
    QuotaNotExceeded,
}

impl ConditionType {
    pub const ALL: [ConditionType; 8] = [
        ConditionType::DatasourceReady,
        ConditionType::Ready,
        ConditionType::Resizing,
        ConditionType::Snapshotting,
        ConditionType::StorageClassReady,
        ConditionType::InUse,
        ConditionType::Migrating,
        ConditionType::QuotaNotExceeded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::DatasourceReady => "DatasourceReady",
            ConditionType::Ready => "Ready",
            ConditionType::Resizing => "Resizing",
            ConditionType::Snapshotting => "Snapshotting",
            ConditionType::StorageClassReady => "StorageClassReady",
            ConditionType::InUse => "InUse",
            ConditionType::Migrating => "Migrating",
            ConditionType::QuotaNotExceeded => "QuotaNotExceeded",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a condition.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// A reason string that is not part of the reason enum of a condition type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown condition reason: {0}")]
pub struct UnknownReason(pub String);

/// A condition reason bound to exactly one condition type.
pub trait Reason: Clone + PartialEq + Send + Sync + fmt::Debug {
    /// The condition type this reason belongs to.
    const CONDITION_TYPE: ConditionType;

    fn as_str(&self) -> &str;
}

macro_rules! condition_reasons {
    (
        $(#[$meta:meta])*
        $name:ident for $ty:ident {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];
        }

        impl Reason for $name {
            const CONDITION_TYPE: ConditionType = ConditionType::$ty;

            fn as_str(&self) -> &str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Reason::as_str(self))
            }
        }

        impl FromStr for $name {
            type Err = UnknownReason;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownReason(other.to_string())),
                }
            }
        }
    };
}

condition_reasons! {
    /// Reasons for the DatasourceReady condition.
    DatasourceReadyReason for DatasourceReady {
        DatasourceReady => "DatasourceReady",
        ContainerRegistrySecretNotFound => "ContainerRegistrySecretNotFound",
        ImageNotReady => "ImageNotReady",
        ClusterImageNotReady => "ClusterImageNotReady",
        VirtualDiskSnapshotNotReady => "VirtualDiskSnapshotNotReady",
        ImageNotFound => "ImageNotFound",
        ClusterImageNotFound => "ClusterImageNotFound",
    }
}

condition_reasons! {
    /// Reasons for the Ready condition.
    ReadyReason for Ready {
        WaitForUserUpload => "WaitForUserUpload",
        Provisioning => "Provisioning",
        ProvisioningNotStarted => "ProvisioningNotStarted",
        WaitingForFirstConsumer => "WaitingForFirstConsumer",
        ProvisioningFailed => "ProvisioningFailed",
        Ready => "Ready",
        /// The claim or its volume disappeared after provisioning.
        PvcLost => "Lost",
        Exporting => "Exporting",
        QuotaExceeded => "QuotaExceeded",
        ImagePullFailed => "ImagePullFailed",
        DatasourceIsNotReady => "DatasourceIsNotReady",
        DatasourceIsNotFound => "DatasourceIsNotFound",
        StorageClassIsNotReady => "StorageClassIsNotReady",
    }
}

condition_reasons! {
    /// Reasons for the Migrating condition.
    MigratingReason for Migrating {
        WaitForTargetReady => "WaitForTargetReady",
        InProgress => "InProgress",
        ResizingInProgress => "ResizingInProgress",
        SnapshottingInProgress => "SnapshottingInProgress",
        StorageClassNotFound => "StorageClassNotFound",
        PendingMigrating => "PendingMigrating",
    }
}

condition_reasons! {
    /// Reasons for the StorageClassReady condition.
    StorageClassReadyReason for StorageClassReady {
        StorageClassReady => "StorageClassReady",
        StorageClassNotFound => "StorageClassNotFound",
        StorageClassNotAllowed => "StorageClassNotAllowed",
        StorageClassDeprecated => "StorageClassDeprecated",
        StorageClassTerminating => "StorageClassTerminating",
    }
}

condition_reasons! {
    /// Reasons for the Resizing condition.
    ResizingReason for Resizing {
        InProgress => "InProgress",
        ShrinkNotAllowed => "ShrinkNotAllowed",
        ResizingNotAvailable => "ResizingNotAvailable",
    }
}

condition_reasons! {
    /// Reasons for the Snapshotting condition.
    SnapshottingReason for Snapshotting {
        InProgress => "InProgress",
    }
}

condition_reasons! {
    /// Reasons for the QuotaNotExceeded condition.
    QuotaNotExceededReason for QuotaNotExceeded {
        QuotaNotExceeded => "QuotaNotExceeded",
        QuotaExceeded => "QuotaExceeded",
    }
}

/// Reasons for the InUse condition.
///
/// `Retained` carries a reason written by something other than this
/// controller. It is never produced by the attachment tracker; it only
/// survives as long as no consumer is observed.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum InUseReason {
    UsedForImageCreation,
    UsedForDataExport,
    AttachedToVirtualMachine,
    NotInUse,
    Retained(String),
}

impl InUseReason {
    /// Reasons that assert the disk is in use, in priority order.
    pub const IN_USE: [InUseReason; 3] = [
        InUseReason::AttachedToVirtualMachine,
        InUseReason::UsedForImageCreation,
        InUseReason::UsedForDataExport,
    ];

    pub fn parse(s: &str) -> Self {
        match s {
            "UsedForImageCreation" => InUseReason::UsedForImageCreation,
            "UsedForDataExport" => InUseReason::UsedForDataExport,
            "AttachedToVirtualMachine" => InUseReason::AttachedToVirtualMachine,
            "NotInUse" => InUseReason::NotInUse,
            other => InUseReason::Retained(other.to_string()),
        }
    }
}

impl Reason for InUseReason {
    const CONDITION_TYPE: ConditionType = ConditionType::InUse;

    fn as_str(&self) -> &str {
        match self {
            InUseReason::UsedForImageCreation => "UsedForImageCreation",
            InUseReason::UsedForDataExport => "UsedForDataExport",
            InUseReason::AttachedToVirtualMachine => "AttachedToVirtualMachine",
            InUseReason::NotInUse => "NotInUse",
            InUseReason::Retained(reason) => reason,
        }
    }
}

impl fmt::Display for InUseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(Reason::as_str(self))
    }
}
