//! Blank disks: an empty claim of the declared size.

use async_trait::async_trait;
use k8s_openapi::api::storage::v1::StorageClass;

use crate::controller::error::Result;
use crate::controller::handler::Outcome;
use crate::controller::pipeline::StepPipeline;
use crate::controller::sources::steps::{
    CreateBlankClaimStep, ReadyStep, TerminatingStep, WaitForClaimStep,
};
use crate::controller::sources::{DataSourceHandler, DiskService, ValidationFailure, declared_size};
use crate::controller::status::ConditionBuilder;
use crate::crd::{ReadyReason, VirtualDisk};

pub struct BlankSource {
    service: DiskService,
}

impl BlankSource {
    pub fn new(service: DiskService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl DataSourceHandler for BlankSource {
    fn name(&self) -> &'static str {
        "blank"
    }

    async fn sync(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<ReadyReason>,
        class: Option<&StorageClass>,
    ) -> Result<Outcome> {
        let (claim, job) = self.service.fetch(disk).await?;
        let store = self.service.store.clone();
        let class = class.cloned();

        StepPipeline::new()
            .then(ReadyStep::new(store.clone(), claim.clone()))
            .then(TerminatingStep::new(claim.clone(), job))
            .then(CreateBlankClaimStep::new(
                store.clone(),
                claim.clone(),
                class.clone(),
                declared_size(disk, "blank"),
            ))
            .then(WaitForClaimStep::new(store, claim, class))
            .run(disk, condition)
            .await
    }

    async fn validate(&self, _disk: &VirtualDisk) -> Result<Option<ValidationFailure>> {
        Ok(None)
    }

    async fn clean_up(&self, disk: &VirtualDisk) -> Result<bool> {
        self.service.clean_up_supplements(disk).await
    }
}
