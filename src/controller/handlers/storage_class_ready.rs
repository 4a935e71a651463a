use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;

use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::controller::handler::{Handler, Outcome};
use crate::controller::sources::provisioning_claim_name;
use crate::controller::status::{self, ConditionBuilder, ConditionScope};
use crate::controller::storage_class::StorageClassService;
use crate::crd::{StorageClassReadyReason, VirtualDisk};
use crate::resources::claim;

/// Owns StorageClassReady and records the class the disk is provisioned on.
///
/// Once a claim exists its class is authoritative; before that the class is
/// resolved and checked against the policy.
pub struct StorageClassReadyHandler {
    ctx: Arc<Context>,
    classes: StorageClassService,
}

impl StorageClassReadyHandler {
    pub fn new(ctx: Arc<Context>) -> Self {
        let classes = StorageClassService::new(ctx.store.clone(), ctx.config.clone());
        Self { ctx, classes }
    }
}

#[async_trait]
impl ConditionScope for StorageClassReadyHandler {
    type Owned = StorageClassReadyReason;
    type Output = Result<Outcome>;

    async fn run(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<StorageClassReadyReason>,
    ) -> Result<Outcome> {
        if disk.is_deleting() {
            return Ok(Outcome::Continue);
        }
        let namespace = disk.namespace().unwrap_or_default();
        let existing = self
            .ctx
            .store
            .get_claim(&namespace, &provisioning_claim_name(disk))
            .await?;

        if let Some(name) = existing.as_ref().and_then(|pvc| claim::storage_class(pvc)) {
            let name = name.to_string();
            if self.classes.get(&name).await?.is_some() {
                condition.set_true(StorageClassReadyReason::StorageClassReady, "");
            } else {
                condition.set_false(
                    StorageClassReadyReason::StorageClassNotFound,
                    format!("StorageClass {name} of the provisioned claim not found"),
                );
            }
            disk.status_mut().storage_class_name = Some(name);
            return Ok(Outcome::Continue);
        }

        let Some(name) = self.classes.resolve_name(disk).await? else {
            condition.set_false(
                StorageClassReadyReason::StorageClassNotFound,
                "No default StorageClass found in the cluster: please specify the storage class name in the virtual disk specification",
            );
            return Ok(Outcome::Continue);
        };
        let check = self.classes.check(&name).await?;
        if check.usable().is_some() {
            condition.set_true(StorageClassReadyReason::StorageClassReady, "");
        } else {
            condition.set_false(check.reason(), check.message());
        }
        disk.status_mut().storage_class_name = Some(name);
        Ok(Outcome::Continue)
    }
}

#[async_trait]
impl Handler for StorageClassReadyHandler {
    fn name(&self) -> &'static str {
        "storage-class-ready"
    }

    async fn handle(&self, disk: &mut VirtualDisk) -> Result<Outcome> {
        status::scoped(self, disk).await
    }
}
