//! Import from an HTTP(S) URL.

use async_trait::async_trait;
use k8s_openapi::api::storage::v1::StorageClass;

use crate::controller::error::{Error, Result};
use crate::controller::handler::Outcome;
use crate::controller::sources::{DataSourceHandler, DiskService, ValidationFailure, declared_size};
use crate::controller::status::ConditionBuilder;
use crate::crd::{DataVolumeSource, HttpImportSource, ReadyReason, VirtualDisk};

pub struct HttpSource {
    service: DiskService,
}

impl HttpSource {
    pub fn new(service: DiskService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl DataSourceHandler for HttpSource {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn sync(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<ReadyReason>,
        class: Option<&StorageClass>,
    ) -> Result<Outcome> {
        let url = disk
            .spec
            .data_source
            .as_ref()
            .and_then(|ds| ds.http.as_ref())
            .map(|http| http.url.clone())
            .ok_or_else(|| Error::MissingField("spec.dataSource.http".to_string()))?;
        let source = DataVolumeSource {
            http: Some(HttpImportSource { url }),
            ..Default::default()
        };
        let size = declared_size(disk, "HTTP");
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
