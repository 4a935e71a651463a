//! Steps shared by the provisioning pipelines.
//!
//! Every step works on objects fetched once before the pipeline runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::common::protect_claim;
use crate::controller::error::Result;
use crate::controller::handler::Outcome;
use crate::controller::pipeline::Step;
use crate::controller::progress::{ProgressRange, next_progress};
use crate::controller::sources::{
    check_declared_size, is_provisioning_finished, provisioning_claim_name,
};
use crate::controller::status::ConditionBuilder;
use crate::controller::storage_class::is_wait_for_first_consumer;
use crate::crd::{
    ANNOTATION_ACCESS_MODES, ANNOTATION_DATA_EXPORT_REQUEST, ANNOTATION_STORAGE_CLASS,
    ANNOTATION_VOLUME_MODE, DataVolume, DataVolumeSource, DiskPhase, ReadyReason, SnapshotPhase,
    VirtualDisk, dv_conditions,
};
use crate::quantity::parse_bytes;
use crate::resources::claim::{self, ClaimParams, generate_blank_claim, generate_snapshot_claim};
use crate::resources::data_volume::generate_data_volume;
use crate::store::DiskStore;

/// Poll interval while an import makes progress.
pub const PROGRESS_REQUEUE: Duration = Duration::from_secs(1);

/// Poll interval while a quota blocks the import.
pub const QUOTA_REQUEUE: Duration = Duration::from_secs(60);

const FIRST_CONSUMER_MESSAGE: &str =
    "The provisioning has been suspended: a created and scheduled virtual machine is awaited";

/// Size of the claim a pipeline is about to create.
#[derive(Clone, Debug, PartialEq)]
pub enum ClaimSize {
    Known(String),
    /// The size cannot be determined; the message explains why.
    Rejected(String),
}

fn class_name(class: Option<&StorageClass>) -> Option<String> {
    class.map(ResourceExt::name_any)
}

fn set_progress(disk: &mut VirtualDisk, progress: &str) {
    disk.status_mut().progress = Some(progress.to_string());
}

/// Record the final state of a provisioned disk.
///
/// A bound claim makes the disk Ready; it is adopted and protected and the
/// import job is no longer needed.
pub async fn complete_provisioning(
    store: &dyn DiskStore,
    disk: &mut VirtualDisk,
    condition: &mut ConditionBuilder<ReadyReason>,
    claim: Option<&PersistentVolumeClaim>,
) -> Result<()> {
    let namespace = disk.namespace().unwrap_or_default();
    let Some(claim) = claim else {
        let name = provisioning_claim_name(disk);
        disk.status_mut().phase = DiskPhase::Lost;
        condition.set_false(ReadyReason::PvcLost, format!("PVC {name} not found."));
        return Ok(());
    };

    if claim::is_lost(claim) {
        if claim
            .annotations()
            .get(ANNOTATION_DATA_EXPORT_REQUEST)
            .is_some_and(|v| v == "true")
        {
            disk.status_mut().phase = DiskPhase::Exporting;
            condition.set_false(ReadyReason::Exporting, "PV is being exported");
        } else {
            let volume = claim
                .spec
                .as_ref()
                .and_then(|s| s.volume_name.clone())
                .unwrap_or_default();
            disk.status_mut().phase = DiskPhase::Lost;
            condition.set_false(ReadyReason::PvcLost, format!("PV {volume} not found."));
        }
        return Ok(());
    }

    let status = disk.status_mut();
    status.phase = DiskPhase::Ready;
    status.progress = Some("100%".to_string());
    status.capacity = claim::capacity(claim).map(String::from);
    if status.target.persistent_volume_claim.is_empty() {
        status.target.persistent_volume_claim = claim.name_any();
    }
    condition.set_true(ReadyReason::Ready, "");

    protect_claim(store, disk, claim).await?;
    store
        .delete_data_volume(&namespace, &disk.supplement_name())
        .await?;
    Ok(())
}

/// Completion bookkeeping for a disk that already finished provisioning.
pub struct ReadyStep {
    store: Arc<dyn DiskStore>,
    claim: Option<PersistentVolumeClaim>,
}

impl ReadyStep {
    pub fn new(store: Arc<dyn DiskStore>, claim: Option<PersistentVolumeClaim>) -> Self {
        Self { store, claim }
    }
}

#[async_trait]
impl Step for ReadyStep {
    async fn take(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<ReadyReason>,
    ) -> Result<Option<Outcome>> {
        if !is_provisioning_finished(disk) {
            return Ok(None);
        }
        complete_provisioning(self.store.as_ref(), disk, condition, self.claim.as_ref()).await?;
        Ok(Some(Outcome::Continue))
    }
}

/// Wait while a supplement is being deleted.
pub struct TerminatingStep {
    claim: Option<PersistentVolumeClaim>,
    data_volume: Option<DataVolume>,
}

impl TerminatingStep {
    pub fn new(claim: Option<PersistentVolumeClaim>, data_volume: Option<DataVolume>) -> Self {
        Self { claim, data_volume }
    }
}

#[async_trait]
impl Step for TerminatingStep {
    async fn take(
        &self,
        disk: &mut VirtualDisk,
        _condition: &mut ConditionBuilder<ReadyReason>,
    ) -> Result<Option<Outcome>> {
        let claim_terminating = self.claim.as_ref().is_some_and(claim::is_terminating);
        let job_terminating = self
            .data_volume
            .as_ref()
            .is_some_and(|dv| dv.metadata.deletion_timestamp.is_some());
        if claim_terminating || job_terminating {
            debug!(disk = %disk.name_any(), "Waiting for supplements to be deleted");
            return Ok(Some(Outcome::RequeueAfter(PROGRESS_REQUEUE)));
        }
        Ok(None)
    }
}

/// Create the claim of a blank disk.
pub struct CreateBlankClaimStep {
    store: Arc<dyn DiskStore>,
    claim: Option<PersistentVolumeClaim>,
    class: Option<StorageClass>,
    size: ClaimSize,
}

impl CreateBlankClaimStep {
    pub fn new(
        store: Arc<dyn DiskStore>,
        claim: Option<PersistentVolumeClaim>,
        class: Option<StorageClass>,
        size: ClaimSize,
    ) -> Self {
        Self {
            store,
            claim,
            class,
            size,
        }
    }
}

#[async_trait]
impl Step for CreateBlankClaimStep {
    async fn take(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<ReadyReason>,
    ) -> Result<Option<Outcome>> {
        if self.claim.is_some() {
            return Ok(None);
        }
        let size = match &self.size {
            ClaimSize::Known(size) => size.clone(),
            ClaimSize::Rejected(message) => {
                disk.status_mut().phase = DiskPhase::Failed;
                condition.set_false(ReadyReason::ProvisioningFailed, message);
                return Ok(Some(Outcome::Continue));
            }
        };

        let name = provisioning_claim_name(disk);
        let params = ClaimParams {
            size,
            storage_class: class_name(self.class.as_ref()),
            ..Default::default()
        };
        self.store
            .create_claim(&generate_blank_claim(disk, &name, &params))
            .await?;
        info!(disk = %disk.name_any(), claim = %name, "Created blank claim");

        disk.status_mut().phase = DiskPhase::Provisioning;
        set_progress(disk, "0%");
        condition.set_false(
            ReadyReason::Provisioning,
            "The PersistentVolumeClaim has been created, waiting for it to be bound",
        );
        Ok(Some(Outcome::RequeueAfter(PROGRESS_REQUEUE)))
    }
}

/// Create the import job filling the claim.
pub struct CreateImportJobStep {
    store: Arc<dyn DiskStore>,
    claim: Option<PersistentVolumeClaim>,
    data_volume: Option<DataVolume>,
    class: Option<StorageClass>,
    source: DataVolumeSource,
    size: ClaimSize,
}

impl CreateImportJobStep {
    pub fn new(
        store: Arc<dyn DiskStore>,
        claim: Option<PersistentVolumeClaim>,
        data_volume: Option<DataVolume>,
        class: Option<StorageClass>,
        source: DataVolumeSource,
        size: ClaimSize,
    ) -> Self {
        Self {
            store,
            claim,
            data_volume,
            class,
            source,
            size,
        }
    }
}

#[async_trait]
impl Step for CreateImportJobStep {
    async fn take(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<ReadyReason>,
    ) -> Result<Option<Outcome>> {
        if self.data_volume.is_some() || self.claim.is_some() {
            return Ok(None);
        }
        let size = match &self.size {
            ClaimSize::Known(size) => size.clone(),
            ClaimSize::Rejected(message) => {
                disk.status_mut().phase = DiskPhase::Failed;
                condition.set_false(ReadyReason::ProvisioningFailed, message);
                return Ok(Some(Outcome::Continue));
            }
        };

        let name = disk.supplement_name();
        let job = generate_data_volume(
            disk,
            &name,
            self.source.clone(),
            &size,
            class_name(self.class.as_ref()),
        );
        self.store.create_data_volume(&job).await?;
        info!(disk = %disk.name_any(), importer = %name, "Created importer");

        disk.status_mut().phase = DiskPhase::Provisioning;
        set_progress(disk, "0%");
        condition.set_false(ReadyReason::Provisioning, "The importer has been created");
        Ok(Some(Outcome::RequeueAfter(PROGRESS_REQUEUE)))
    }
}

/// Follow the import job until it succeeds.
pub struct WaitForImportJobStep {
    data_volume: Option<DataVolume>,
    has_claim: bool,
    class: Option<StorageClass>,
    range: ProgressRange,
}

impl WaitForImportJobStep {
    pub fn new(
        data_volume: Option<DataVolume>,
        has_claim: bool,
        class: Option<StorageClass>,
        range: ProgressRange,
    ) -> Self {
        Self {
            data_volume,
            has_claim,
            class,
            range,
        }
    }

    fn waits_for_first_consumer(&self, dv: &DataVolume) -> bool {
        let wffc = self.class.as_ref().is_some_and(is_wait_for_first_consumer);
        let not_started = dv
            .condition(dv_conditions::RUNNING)
            .is_none_or(|c| c.reason.is_empty() || c.reason == "Pending");
        wffc && dv.is_waiting_for_first_consumer() && not_started
    }
}

#[async_trait]
impl Step for WaitForImportJobStep {
    async fn take(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<ReadyReason>,
    ) -> Result<Option<Outcome>> {
        let Some(dv) = &self.data_volume else {
            if self.has_claim {
                return Ok(None);
            }
            disk.status_mut().phase = DiskPhase::Provisioning;
            condition.set_false(ReadyReason::Provisioning, "Waiting for the importer to be created");
            return Ok(Some(Outcome::RequeueAfter(PROGRESS_REQUEUE)));
        };

        let status = disk.status_mut();
        status.progress = next_progress(dv.progress(), status.progress.as_deref(), self.range);
        if let Some(claim_name) = dv
            .status
            .as_ref()
            .and_then(|s| s.claim_name.as_deref())
            .filter(|n| !n.is_empty())
        {
            status.target.persistent_volume_claim = claim_name.to_string();
        }

        if dv.is_waiting_for_upload() {
            disk.status_mut().phase = DiskPhase::WaitForUserUpload;
            condition.set_false(ReadyReason::WaitForUserUpload, "Waiting for the user upload");
            return Ok(Some(Outcome::RequeueAfter(PROGRESS_REQUEUE)));
        }

        if self.waits_for_first_consumer(dv) {
            disk.status_mut().phase = DiskPhase::WaitForFirstConsumer;
            condition.set_false(ReadyReason::WaitingForFirstConsumer, FIRST_CONSUMER_MESSAGE);
            // Later handlers must see the consumer that unblocks binding.
            return Ok(Some(Outcome::Continue));
        }

        if let Some(quota) = dv.quota_exceeded() {
            disk.status_mut().phase = if dv.is_waiting_for_first_consumer() {
                DiskPhase::WaitForFirstConsumer
            } else {
                DiskPhase::Pending
            };
            condition.set_false(ReadyReason::QuotaExceeded, &quota.message);
            return Ok(Some(Outcome::RequeueAfter(QUOTA_REQUEUE)));
        }

        if let Some(running) = dv.condition(dv_conditions::RUNNING) {
            if running.reason == dv_conditions::REASON_IMAGE_PULL_FAILED {
                disk.status_mut().phase = DiskPhase::Provisioning;
                condition.set_false(ReadyReason::ImagePullFailed, &running.message);
                return Ok(Some(Outcome::RequeueAfter(PROGRESS_REQUEUE)));
            }
            if running.reason.contains("Error") {
                disk.status_mut().phase = DiskPhase::Failed;
                condition.set_false(ReadyReason::ProvisioningFailed, &running.message);
                return Ok(Some(Outcome::Continue));
            }
        }

        if !dv.is_succeeded() {
            disk.status_mut().phase = DiskPhase::Provisioning;
            condition.set_false(
                ReadyReason::Provisioning,
                "Import is in the process of provisioning to the PersistentVolumeClaim",
            );
            return Ok(Some(Outcome::RequeueAfter(PROGRESS_REQUEUE)));
        }

        Ok(None)
    }
}

/// Wait for the claim to bind, then complete provisioning.
pub struct WaitForClaimStep {
    store: Arc<dyn DiskStore>,
    claim: Option<PersistentVolumeClaim>,
    class: Option<StorageClass>,
}

impl WaitForClaimStep {
    pub fn new(
        store: Arc<dyn DiskStore>,
        claim: Option<PersistentVolumeClaim>,
        class: Option<StorageClass>,
    ) -> Self {
        Self {
            store,
            claim,
            class,
        }
    }
}

#[async_trait]
impl Step for WaitForClaimStep {
    async fn take(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<ReadyReason>,
    ) -> Result<Option<Outcome>> {
        let Some(claim) = &self.claim else {
            disk.status_mut().phase = DiskPhase::Provisioning;
            condition.set_false(
                ReadyReason::Provisioning,
                "Waiting for the PersistentVolumeClaim to be created",
            );
            return Ok(Some(Outcome::RequeueAfter(PROGRESS_REQUEUE)));
        };

        if claim::is_bound(claim) || claim::is_lost(claim) {
            complete_provisioning(self.store.as_ref(), disk, condition, Some(claim)).await?;
            if claim::is_bound(claim) {
                info!(disk = %disk.name_any(), claim = %claim.name_any(), "Disk is ready");
            }
            return Ok(Some(Outcome::Continue));
        }

        if self.class.as_ref().is_some_and(is_wait_for_first_consumer) {
            disk.status_mut().phase = DiskPhase::WaitForFirstConsumer;
            condition.set_false(ReadyReason::WaitingForFirstConsumer, FIRST_CONSUMER_MESSAGE);
            // Binding waits on a consumer; the claim watch wakes the disk.
            return Ok(Some(Outcome::Continue));
        }
        disk.status_mut().phase = DiskPhase::Provisioning;
        condition.set_false(
            ReadyReason::Provisioning,
            "Waiting for the PersistentVolumeClaim to be bound",
        );
        Ok(Some(Outcome::RequeueAfter(PROGRESS_REQUEUE)))
    }
}

/// Create the claim restoring a disk snapshot.
pub struct CreateClaimFromSnapshotStep {
    store: Arc<dyn DiskStore>,
    claim: Option<PersistentVolumeClaim>,
    class: Option<StorageClass>,
    snapshot: String,
}

impl CreateClaimFromSnapshotStep {
    pub fn new(
        store: Arc<dyn DiskStore>,
        claim: Option<PersistentVolumeClaim>,
        class: Option<StorageClass>,
        snapshot: String,
    ) -> Self {
        Self {
            store,
            claim,
            class,
            snapshot,
        }
    }

    fn not_ready(
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<ReadyReason>,
        message: String,
    ) -> Result<Option<Outcome>> {
        disk.status_mut().phase = DiskPhase::Pending;
        condition.set_false(ReadyReason::ProvisioningNotStarted, message);
        Ok(Some(Outcome::RequeueAfter(PROGRESS_REQUEUE)))
    }
}

/// Pick the claim size for a restore: the declared size when it is at
/// least the snapshot's restore size.
fn restore_size(declared: Option<&str>, restore: Option<&str>) -> Option<String> {
    match (declared, restore) {
        (Some(d), Some(r)) => match (parse_bytes(d), parse_bytes(r)) {
            (Ok(db), Ok(rb)) if db >= rb => Some(d.to_string()),
            _ => Some(r.to_string()),
        },
        (Some(d), None) => Some(d.to_string()),
        (None, r) => r.map(String::from),
    }
}

#[async_trait]
impl Step for CreateClaimFromSnapshotStep {
    async fn take(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<ReadyReason>,
    ) -> Result<Option<Outcome>> {
        if self.claim.is_some() {
            return Ok(None);
        }
        if let Some(Err(message)) = disk.declared_size().map(check_declared_size) {
            disk.status_mut().phase = DiskPhase::Failed;
            condition.set_false(ReadyReason::ProvisioningFailed, message);
            return Ok(Some(Outcome::Continue));
        }
        let namespace = disk.namespace().unwrap_or_default();

        let volume_snapshot_name = self
            .store
            .get_disk_snapshot(&namespace, &self.snapshot)
            .await?
            .filter(|s| s.phase() == SnapshotPhase::Ready)
            .and_then(|s| s.status.and_then(|st| st.volume_snapshot_name));
        let Some(volume_snapshot_name) = volume_snapshot_name else {
            let message = format!("VirtualDiskSnapshot {} is not ready", self.snapshot);
            return Self::not_ready(disk, condition, message);
        };
        let Some(volume_snapshot) = self
            .store
            .get_volume_snapshot(&namespace, &volume_snapshot_name)
            .await?
        else {
            let message = format!("VolumeSnapshot {volume_snapshot_name} not found");
            return Self::not_ready(disk, condition, message);
        };

        let annotations = volume_snapshot.annotations();
        let Some(size) = restore_size(disk.declared_size(), volume_snapshot.restore_size()) else {
            disk.status_mut().phase = DiskPhase::Failed;
            condition.set_false(
                ReadyReason::ProvisioningFailed,
                "The restore size of the snapshot is unknown, please set spec.persistentVolumeClaim.size",
            );
            return Ok(Some(Outcome::Continue));
        };
        let params = ClaimParams {
            size,
            storage_class: annotations
                .get(ANNOTATION_STORAGE_CLASS)
                .cloned()
                .or_else(|| class_name(self.class.as_ref())),
            access_modes: annotations
                .get(ANNOTATION_ACCESS_MODES)
                .map(|modes| {
                    modes
                        .split(',')
                        .map(str::trim)
                        .filter(|m| !m.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            volume_mode: annotations.get(ANNOTATION_VOLUME_MODE).cloned(),
        };

        let name = provisioning_claim_name(disk);
        self.store
            .create_claim(&generate_snapshot_claim(disk, &name, &volume_snapshot_name, &params))
            .await?;
        info!(disk = %disk.name_any(), claim = %name, snapshot = %self.snapshot, "Restoring snapshot");

        disk.status_mut().phase = DiskPhase::Provisioning;
        set_progress(disk, "0%");
        condition.set_false(
            ReadyReason::Provisioning,
            "The PersistentVolumeClaim restoring the snapshot has been created",
        );
        Ok(Some(Outcome::RequeueAfter(PROGRESS_REQUEUE)))
    }
}
