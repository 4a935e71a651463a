//! Typed view of the CDI DataVolume used as the disk's import job.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Asks the importer to bind claims immediately on first-consumer classes.
pub const ANNOTATION_IMMEDIATE_BINDING: &str = "cdi.kubevirt.io/storage.bind.immediate.requested";

/// Import job filling a claim from a data source.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "cdi.kubevirt.io",
    version = "v1beta1",
    kind = "DataVolume",
    plural = "datavolumes",
    shortname = "dv",
    status = "DataVolumeStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSpec {
    pub source: DataVolumeSource,
    pub storage: DataVolumeStorage,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpImportSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryImportSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<ClaimImportSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<EmptySource>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpImportSource {
    pub url: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistryImportSource {
    /// `docker://` URL of the image.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimImportSource {
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct EmptySource {}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeStorage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<String>,
    #[serde(default)]
    pub resources: StorageResources,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageResources {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeStatus {
    #[serde(default)]
    pub phase: String,
    /// Import progress, e.g. "45.12%" or "N/A".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_name: Option<String>,
    #[serde(default)]
    pub conditions: Vec<DataVolumeCondition>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeCondition {
    pub r#type: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// DataVolume phases the disk controller distinguishes.
pub mod dv_phases {
    pub const SUCCEEDED: &str = "Succeeded";
    pub const WAIT_FOR_FIRST_CONSUMER: &str = "WaitForFirstConsumer";
    pub const PENDING_POPULATION: &str = "PendingPopulation";
    pub const UPLOAD_SCHEDULED: &str = "UploadScheduled";
    pub const UPLOAD_READY: &str = "UploadReady";
}

/// DataVolume condition types and reasons.
pub mod dv_conditions {
    pub const RUNNING: &str = "Running";
    pub const QUOTA_NOT_EXCEEDED: &str = "QuotaNotExceeded";
    pub const REASON_IMAGE_PULL_FAILED: &str = "ImagePullFailed";
}

impl DataVolume {
    pub fn phase(&self) -> &str {
        self.status.as_ref().map(|s| s.phase.as_str()).unwrap_or("")
    }

    pub fn progress(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.progress.as_deref())
    }

    pub fn condition(&self, condition_type: &str) -> Option<&DataVolumeCondition> {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.r#type == condition_type))
    }

    pub fn is_succeeded(&self) -> bool {
        self.phase() == dv_phases::SUCCEEDED
    }

    pub fn is_waiting_for_upload(&self) -> bool {
        matches!(self.phase(), dv_phases::UPLOAD_SCHEDULED | dv_phases::UPLOAD_READY)
    }

    pub fn is_waiting_for_first_consumer(&self) -> bool {
        matches!(
            self.phase(),
            dv_phases::WAIT_FOR_FIRST_CONSUMER | dv_phases::PENDING_POPULATION
        )
    }

    /// Quota blocks the import (QuotaNotExceeded is explicitly False).
    pub fn quota_exceeded(&self) -> Option<&DataVolumeCondition> {
        self.condition(dv_conditions::QUOTA_NOT_EXCEEDED)
            .filter(|c| c.status == "False")
    }
}
