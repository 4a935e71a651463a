//! Content uploaded by the user through the importer's upload endpoint.

use async_trait::async_trait;
use k8s_openapi::api::storage::v1::StorageClass;

use crate::controller::error::Result;
use crate::controller::handler::Outcome;
use crate::controller::sources::{DataSourceHandler, DiskService, ValidationFailure, declared_size};
use crate::controller::status::ConditionBuilder;
use crate::crd::{DataVolumeSource, EmptySource, ReadyReason, VirtualDisk};

pub struct UploadSource {
    service: DiskService,
}

impl UploadSource {
    pub fn new(service: DiskService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl DataSourceHandler for UploadSource {
    fn name(&self) -> &'static str {
        "upload"
    }

    async fn sync(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<ReadyReason>,
        class: Option<&StorageClass>,
    ) -> Result<Outcome> {
        let source = DataVolumeSource {
            upload: Some(EmptySource {}),
            ..Default::default()
        };
        let size = declared_size(disk, "upload");
        self.service
            .run_import(disk, condition, class, source, size)
            .await
    }

    async fn validate(&self, _disk: &VirtualDisk) -> Result<Option<ValidationFailure>> {
        Ok(None)
    }

    async fn clean_up(&self, disk: &VirtualDisk) -> Result<bool> {
        self.service.clean_up_supplements(disk).await
    }
}
