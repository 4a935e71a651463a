//! Import from a container image in an external registry.

use async_trait::async_trait;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;

use crate::controller::error::{Error, Result};
use crate::controller::handler::Outcome;
use crate::controller::sources::{DataSourceHandler, DiskService, ValidationFailure, declared_size};
use crate::controller::status::ConditionBuilder;
use crate::crd::{
    ContainerImageSource, DataVolumeSource, DatasourceReadyReason, ReadyReason,
    RegistryImportSource, VirtualDisk,
};

/// Importer URL of an image reference.
pub fn docker_url(image: &str) -> String {
    if image.starts_with("docker://") {
        image.to_string()
    } else {
        format!("docker://{image}")
    }
}

pub struct RegistrySource {
    service: DiskService,
}

impl RegistrySource {
    pub fn new(service: DiskService) -> Self {
        Self { service }
    }

    fn image(disk: &VirtualDisk) -> Result<&ContainerImageSource> {
        disk.spec
            .data_source
            .as_ref()
            .and_then(|ds| ds.container_image.as_ref())
            .ok_or_else(|| Error::MissingField("spec.dataSource.containerImage".to_string()))
    }
}

#[async_trait]
impl DataSourceHandler for RegistrySource {
    fn name(&self) -> &'static str {
        "registry"
    }

    async fn sync(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<ReadyReason>,
        class: Option<&StorageClass>,
    ) -> Result<Outcome> {
        let image = Self::image(disk)?;
        let source = DataVolumeSource {
            registry: Some(RegistryImportSource {
                url: docker_url(&image.image),
                secret_ref: image.image_pull_secret.clone(),
            }),
            ..Default::default()
        };
        let size = declared_size(disk, "container image");
        self.service
            .run_import(disk, condition, class, source, size)
            .await
    }

    async fn validate(&self, disk: &VirtualDisk) -> Result<Option<ValidationFailure>> {
        let Some(secret) = Self::image(disk)?.image_pull_secret.as_deref() else {
            return Ok(None);
        };
        let namespace = disk.namespace().unwrap_or_default();
        if self.service.store.secret_exists(&namespace, secret).await? {
            return Ok(None);
        }
        Ok(Some(ValidationFailure::new(
            DatasourceReadyReason::ContainerRegistrySecretNotFound,
            format!("Container registry secret {secret} not found."),
        )))
    }

    async fn clean_up(&self, disk: &VirtualDisk) -> Result<bool> {
        self.service.clean_up_supplements(disk).await
    }
}
