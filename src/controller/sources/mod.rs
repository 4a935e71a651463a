//! Data sources a disk can be provisioned from.
//!
//! Each variant implements [`DataSourceHandler`] and drives provisioning
//! through a [`StepPipeline`](crate::controller::pipeline::StepPipeline).
//! [`Sources::get`] dispatches on the closed set of source kinds.

pub mod blank;
pub mod http;
pub mod object_ref;
pub mod registry;
pub mod steps;
pub mod upload;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use tracing::debug;

use crate::config::OperatorConfig;
use crate::controller::common::delete_claim;
use crate::controller::error::Result;
use crate::controller::handler::Outcome;
use crate::controller::pipeline::StepPipeline;
use crate::controller::progress::ProgressRange;
use crate::controller::status::{self, ConditionBuilder};
use crate::crd::{
    DataSourceKind, DataVolume, DataVolumeSource, DatasourceReadyReason, ReadyReason, VirtualDisk,
};
use crate::quantity::parse_bytes;
use crate::store::DiskStore;

pub use blank::BlankSource;
pub use http::HttpSource;
pub use object_ref::ObjectRefSource;
pub use registry::RegistrySource;
pub use steps::ClaimSize;
pub use upload::UploadSource;

/// Why a data source cannot be provisioned from.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidationFailure {
    pub reason: DatasourceReadyReason,
    pub message: String,
}

impl ValidationFailure {
    pub fn new(reason: DatasourceReadyReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Contract of every data source variant.
#[async_trait]
pub trait DataSourceHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Drive provisioning one step further, writing the Ready condition.
    async fn sync(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<ReadyReason>,
        class: Option<&StorageClass>,
    ) -> Result<Outcome>;

    /// Check that the upstream object can be provisioned from.
    async fn validate(&self, disk: &VirtualDisk) -> Result<Option<ValidationFailure>>;

    /// Delete transient provisioning resources. Returns whether anything
    /// was still present.
    async fn clean_up(&self, disk: &VirtualDisk) -> Result<bool>;
}

/// The disk reports terminal success or loss.
pub fn is_provisioning_finished(disk: &VirtualDisk) -> bool {
    matches!(
        status::reason::<ReadyReason>(disk.conditions()),
        Some(ReadyReason::Ready | ReadyReason::PvcLost | ReadyReason::Exporting)
    )
}

/// Name of the claim provisioning works on.
pub fn provisioning_claim_name(disk: &VirtualDisk) -> String {
    disk.provisioned_claim_name()
        .map(String::from)
        .unwrap_or_else(|| disk.supplement_name())
}

/// Operations shared by the source variants.
#[derive(Clone)]
pub struct DiskService {
    pub store: Arc<dyn DiskStore>,
    pub config: Arc<OperatorConfig>,
}

impl DiskService {
    pub fn new(store: Arc<dyn DiskStore>, config: Arc<OperatorConfig>) -> Self {
        Self { store, config }
    }

    /// Fetch the claim and import job of a disk once per pass.
    pub async fn fetch(
        &self,
        disk: &VirtualDisk,
    ) -> Result<(Option<PersistentVolumeClaim>, Option<DataVolume>)> {
        let namespace = disk.namespace().unwrap_or_default();
        let claim = self
            .store
            .get_claim(&namespace, &provisioning_claim_name(disk))
            .await?;
        let job = self
            .store
            .get_data_volume(&namespace, &disk.supplement_name())
            .await?;
        Ok((claim, job))
    }

    /// Delete the import job and, while the disk is unfinished, its claim.
    pub async fn clean_up_supplements(&self, disk: &VirtualDisk) -> Result<bool> {
        let namespace = disk.namespace().unwrap_or_default();
        let name = disk.supplement_name();
        let mut found = false;

        if self.store.get_data_volume(&namespace, &name).await?.is_some() {
            debug!(disk = %disk.name_any(), importer = %name, "Deleting importer");
            self.store.delete_data_volume(&namespace, &name).await?;
            found = true;
        }
        if !is_provisioning_finished(disk) && self.store.get_claim(&namespace, &name).await?.is_some() {
            debug!(disk = %disk.name_any(), claim = %name, "Deleting unfinished claim");
            delete_claim(self.store.as_ref(), &namespace, &name).await?;
            found = true;
        }
        Ok(found)
    }

    /// Pipeline of the sources that fill the claim with an import job.
    pub async fn run_import(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<ReadyReason>,
        class: Option<&StorageClass>,
        source: DataVolumeSource,
        size: ClaimSize,
    ) -> Result<Outcome> {
        let (claim, job) = self.fetch(disk).await?;
        let class = class.cloned();
        let pipeline = StepPipeline::new()
            .then(steps::ReadyStep::new(self.store.clone(), claim.clone()))
            .then(steps::TerminatingStep::new(claim.clone(), job.clone()))
            .then(steps::CreateImportJobStep::new(
                self.store.clone(),
                claim.clone(),
                job.clone(),
                class.clone(),
                source,
                size,
            ))
            .then(steps::WaitForImportJobStep::new(
                job,
                claim.is_some(),
                class.clone(),
                ProgressRange::default(),
            ))
            .then(steps::WaitForClaimStep::new(self.store.clone(), claim, class));
        pipeline.run(disk, condition).await
    }
}

/// Check that a declared size is a positive quantity.
///
/// The error is the message recorded on the Ready condition.
pub fn check_declared_size(size: &str) -> std::result::Result<i64, String> {
    match parse_bytes(size) {
        Ok(bytes) if bytes > 0 => Ok(bytes),
        Ok(_) => Err(format!(
            "Spec.persistentVolumeClaim.size {size} should be greater than zero."
        )),
        Err(e) => Err(format!("Spec.persistentVolumeClaim.size is invalid: {e}.")),
    }
}

/// Size of a disk whose source has no size of its own.
pub fn declared_size(disk: &VirtualDisk, kind: &str) -> ClaimSize {
    match disk.declared_size() {
        Some(size) => match check_declared_size(size) {
            Ok(_) => ClaimSize::Known(size.to_string()),
            Err(message) => ClaimSize::Rejected(message),
        },
        None => ClaimSize::Rejected(format!(
            "Spec.persistentVolumeClaim.size should be set for a {kind} virtual disk."
        )),
    }
}

/// Registry of the data source variants.
pub struct Sources {
    service: DiskService,
    blank: BlankSource,
    http: HttpSource,
    registry: RegistrySource,
    upload: UploadSource,
    object_ref: ObjectRefSource,
}

impl Sources {
    pub fn new(store: Arc<dyn DiskStore>, config: Arc<OperatorConfig>) -> Self {
        let service = DiskService::new(store, config);
        Self {
            blank: BlankSource::new(service.clone()),
            http: HttpSource::new(service.clone()),
            registry: RegistrySource::new(service.clone()),
            upload: UploadSource::new(service.clone()),
            object_ref: ObjectRefSource::new(service.clone()),
            service,
        }
    }

    pub fn get(&self, kind: DataSourceKind) -> &dyn DataSourceHandler {
        match kind {
            DataSourceKind::Blank => &self.blank,
            DataSourceKind::Http => &self.http,
            DataSourceKind::ContainerImage => &self.registry,
            DataSourceKind::Upload => &self.upload,
            DataSourceKind::ObjectRef => &self.object_ref,
        }
    }

    pub fn for_disk(&self, disk: &VirtualDisk) -> &dyn DataSourceHandler {
        self.get(disk.data_source_kind())
    }

    /// Clean up after every variant; the declared source may have changed
    /// since the supplements were created.
    pub async fn clean_up(&self, disk: &VirtualDisk) -> Result<bool> {
        let handlers: [&dyn DataSourceHandler; 5] = [
            &self.blank,
            &self.http,
            &self.registry,
            &self.upload,
            &self.object_ref,
        ];
        let mut found = false;
        for handler in handlers {
            found |= handler.clean_up(disk).await?;
        }
        Ok(found)
    }

    pub fn service(&self) -> &DiskService {
        &self.service
    }
}
