//! Disks created from another object of the platform.
//!
//! Four variants exist: a VirtualImage kept on a claim of its own (cloned),
//! a VirtualImage kept in the registry cache, a ClusterVirtualImage (both
//! pulled from the registry cache) and a VirtualDiskSnapshot (restored).

use async_trait::async_trait;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;

use crate::controller::error::{Error, Result};
use crate::controller::handler::Outcome;
use crate::controller::pipeline::StepPipeline;
use crate::controller::sources::registry::docker_url;
use crate::controller::sources::steps::{
    ClaimSize, CreateClaimFromSnapshotStep, PROGRESS_REQUEUE, ReadyStep, TerminatingStep,
    WaitForClaimStep,
};
use crate::controller::sources::{
    DataSourceHandler, DiskService, ValidationFailure, check_declared_size,
};
use crate::controller::status::ConditionBuilder;
use crate::crd::{
    ClaimImportSource, DataVolumeSource, DatasourceReadyReason, DiskPhase, ImageStatus,
    ImageStorage, ObjectRefKind, ObjectRefSource as DeclaredObjectRef, ReadyReason,
    RegistryImportSource, SnapshotPhase, VirtualDisk,
};
use crate::quantity::parse_bytes;

const SMALLER_THAN_UNPACKED: &str = "The specified size is smaller than the image's unpacked size.";

/// Claim size for a disk filled from an image.
///
/// The declared size wins when it can hold the unpacked image; without a
/// declared size the unpacked size is used.
pub fn image_claim_size(declared: Option<&str>, unpacked: Option<&str>) -> Result<ClaimSize> {
    let declared = match declared {
        Some(size) => match check_declared_size(size) {
            Ok(bytes) => Some((size, bytes)),
            Err(message) => return Ok(ClaimSize::Rejected(message)),
        },
        None => None,
    };
    match (declared, unpacked) {
        (Some((declared, bytes)), Some(unpacked)) => {
            if bytes < parse_bytes(unpacked)? {
                Ok(ClaimSize::Rejected(SMALLER_THAN_UNPACKED.to_string()))
            } else {
                Ok(ClaimSize::Known(declared.to_string()))
            }
        }
        (Some((declared, _)), None) => Ok(ClaimSize::Known(declared.to_string())),
        (None, Some(unpacked)) => Ok(ClaimSize::Known(unpacked.to_string())),
        (None, None) => Ok(ClaimSize::Rejected(
            "The unpacked size of the image is unknown, please set spec.persistentVolumeClaim.size."
                .to_string(),
        )),
    }
}

/// Import job source and unpacked size of a ready image.
struct ImageImport {
    source: DataVolumeSource,
    unpacked: Option<String>,
}

pub struct ObjectRefSource {
    service: DiskService,
}

impl ObjectRefSource {
    pub fn new(service: DiskService) -> Self {
        Self { service }
    }

    fn reference(disk: &VirtualDisk) -> Result<&DeclaredObjectRef> {
        disk.spec
            .data_source
            .as_ref()
            .and_then(|ds| ds.object_ref.as_ref())
            .ok_or_else(|| Error::MissingField("spec.dataSource.objectRef".to_string()))
    }

    fn registry_source(&self, status: &ImageStatus) -> Option<DataVolumeSource> {
        let url = status.target.registry_url.as_deref()?;
        Some(DataVolumeSource {
            registry: Some(RegistryImportSource {
                url: docker_url(url),
                secret_ref: self.service.config.registry_auth_secret.clone(),
            }),
            ..Default::default()
        })
    }

    /// Resolve the import of an image reference, `None` while the image
    /// cannot be imported from.
    async fn image_import(
        &self,
        namespace: &str,
        reference: &DeclaredObjectRef,
    ) -> Result<Option<ImageImport>> {
        let store = &self.service.store;
        match reference.kind {
            ObjectRefKind::VirtualImage => {
                let Some(image) = store.get_virtual_image(namespace, &reference.name).await? else {
                    return Ok(None);
                };
                let Some(status) = image.status.as_ref().filter(|s| s.is_ready()) else {
                    return Ok(None);
                };
                let source = match image.spec.storage {
                    ImageStorage::PersistentVolumeClaim => {
                        status.target.persistent_volume_claim.as_ref().map(|claim| {
                            DataVolumeSource {
                                pvc: Some(ClaimImportSource {
                                    namespace: namespace.to_string(),
                                    name: claim.clone(),
                                }),
                                ..Default::default()
                            }
                        })
                    }
                    ImageStorage::ContainerRegistry => self.registry_source(status),
                };
                Ok(source.map(|source| ImageImport {
                    source,
                    unpacked: status.size.unpacked.clone(),
                }))
            }
            ObjectRefKind::ClusterVirtualImage => {
                let Some(image) = store.get_cluster_virtual_image(&reference.name).await? else {
                    return Ok(None);
                };
                let Some(status) = image.status.as_ref().filter(|s| s.is_ready()) else {
                    return Ok(None);
                };
                Ok(self.registry_source(status).map(|source| ImageImport {
                    source,
                    unpacked: status.size.unpacked.clone(),
                }))
            }
            ObjectRefKind::VirtualDiskSnapshot => Ok(None),
        }
    }

    async fn sync_snapshot(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<ReadyReason>,
        class: Option<&StorageClass>,
        snapshot: String,
    ) -> Result<Outcome> {
        let (claim, job) = self.service.fetch(disk).await?;
        let store = self.service.store.clone();
        let class = class.cloned();

        StepPipeline::new()
            .then(ReadyStep::new(store.clone(), claim.clone()))
            .then(TerminatingStep::new(claim.clone(), job))
            .then(CreateClaimFromSnapshotStep::new(
                store.clone(),
                claim.clone(),
                class.clone(),
                snapshot,
            ))
            .then(WaitForClaimStep::new(store, claim, class))
            .run(disk, condition)
            .await
    }
}

#[async_trait]
impl DataSourceHandler for ObjectRefSource {
    fn name(&self) -> &'static str {
        "objectref"
    }

    async fn sync(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<ReadyReason>,
        class: Option<&StorageClass>,
    ) -> Result<Outcome> {
        let reference = Self::reference(disk)?.clone();
        if reference.kind == ObjectRefKind::VirtualDiskSnapshot {
            return self.sync_snapshot(disk, condition, class, reference.name).await;
        }

        let namespace = disk.namespace().unwrap_or_default();
        let Some(import) = self.image_import(&namespace, &reference).await? else {
            // A finished disk no longer needs its image.
            if super::is_provisioning_finished(disk) {
                let (claim, _) = self.service.fetch(disk).await?;
                let step = ReadyStep::new(self.service.store.clone(), claim);
                return StepPipeline::new().then(step).run(disk, condition).await;
            }
            disk.status_mut().phase = DiskPhase::Pending;
            condition.set_false(
                ReadyReason::ProvisioningNotStarted,
                format!("{} {} is not ready for provisioning.", reference.kind, reference.name),
            );
            return Ok(Outcome::RequeueAfter(PROGRESS_REQUEUE));
        };

        let size = image_claim_size(disk.declared_size(), import.unpacked.as_deref())?;
        self.service
            .run_import(disk, condition, class, import.source, size)
            .await
    }

    async fn validate(&self, disk: &VirtualDisk) -> Result<Option<ValidationFailure>> {
        let reference = Self::reference(disk)?;
        let namespace = disk.namespace().unwrap_or_default();
        let store = &self.service.store;
        let name = &reference.name;

        let failure = match reference.kind {
            ObjectRefKind::VirtualImage => match store.get_virtual_image(&namespace, name).await? {
                None => Some(ValidationFailure::new(
                    DatasourceReadyReason::ImageNotFound,
                    format!("VirtualImage {name} not found."),
                )),
                Some(image) if !image.status.as_ref().is_some_and(ImageStatus::is_ready) => {
                    Some(ValidationFailure::new(
                        DatasourceReadyReason::ImageNotReady,
                        format!("VirtualImage {name} is not ready."),
                    ))
                }
                Some(_) => None,
            },
            ObjectRefKind::ClusterVirtualImage => {
                match store.get_cluster_virtual_image(name).await? {
                    None => Some(ValidationFailure::new(
                        DatasourceReadyReason::ClusterImageNotFound,
                        format!("ClusterVirtualImage {name} not found."),
                    )),
                    Some(image) if !image.status.as_ref().is_some_and(ImageStatus::is_ready) => {
                        Some(ValidationFailure::new(
                            DatasourceReadyReason::ClusterImageNotReady,
                            format!("ClusterVirtualImage {name} is not ready."),
                        ))
                    }
                    Some(_) => None,
                }
            }
            ObjectRefKind::VirtualDiskSnapshot => {
                match store.get_disk_snapshot(&namespace, name).await? {
                    None => Some(ValidationFailure::new(
                        DatasourceReadyReason::VirtualDiskSnapshotNotReady,
                        format!("VirtualDiskSnapshot {name} not found."),
                    )),
                    Some(snapshot) if snapshot.phase() != SnapshotPhase::Ready => {
                        Some(ValidationFailure::new(
                            DatasourceReadyReason::VirtualDiskSnapshotNotReady,
                            format!("VirtualDiskSnapshot {name} is not ready."),
                        ))
                    }
                    Some(_) => None,
                }
            }
        };
        Ok(failure)
    }

    async fn clean_up(&self, disk: &VirtualDisk) -> Result<bool> {
        self.service.clean_up_supplements(disk).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_size_must_hold_image() {
        assert_eq!(
            image_claim_size(Some("1Gi"), Some("2Gi")).unwrap(),
            ClaimSize::Rejected(SMALLER_THAN_UNPACKED.to_string())
        );
        assert_eq!(
            image_claim_size(Some("10Gi"), Some("2Gi")).unwrap(),
            ClaimSize::Known("10Gi".to_string())
        );
    }

    #[test]
    fn test_unpacked_size_used_when_undeclared() {
        assert_eq!(
            image_claim_size(None, Some("2Gi")).unwrap(),
            ClaimSize::Known("2Gi".to_string())
        );
        assert!(matches!(image_claim_size(None, None).unwrap(), ClaimSize::Rejected(_)));
        assert!(matches!(
            image_claim_size(Some("lots"), Some("2Gi")).unwrap(),
            ClaimSize::Rejected(_)
        ));
        assert!(image_claim_size(Some("1Gi"), Some("garbage")).is_err());
    }
}
