use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::attachment::{
    InUseDecision, UsageFacts, attached_machines, decide, machine_uses_disk, mounted_machine,
};
use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::controller::handler::{Handler, Outcome};
use crate::controller::status::{self, ConditionBuilder, ConditionScope};
use crate::crd::{
    ANNOTATION_DATA_EXPORT_REQUEST, ConditionType, DiskPhase, InUseReason, MachinePhase,
    VirtualDisk,
};
use crate::resources::claim;

/// Owns InUse and keeps `status.attachedTo` current.
pub struct InUseHandler {
    ctx: Arc<Context>,
}

impl InUseHandler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Usage of the disk by each machine referencing it.
    async fn machine_usage(&self, namespace: &str, disk: &str) -> Result<BTreeMap<String, bool>> {
        let mut usage = BTreeMap::new();
        for machine in self.ctx.store.list_virtual_machines(namespace).await? {
            if !machine.uses_disk(disk) {
                continue;
            }
            let name = machine.name_any();
            let active = if machine.phase() == Some(MachinePhase::Stopped) {
                self.ctx
                    .store
                    .machine_has_active_runtime(namespace, &name)
                    .await?
            } else {
                false
            };
            usage.insert(name, machine_uses_disk(&machine, active));
        }
        Ok(usage)
    }

    /// An image is being built from the disk.
    async fn used_for_image(&self, disk: &VirtualDisk) -> Result<bool> {
        if disk.phase() != DiskPhase::Ready {
            return Ok(false);
        }
        let namespace = disk.namespace();
        let name = disk.name_any();

        let images = self
            .ctx
            .store
            .list_virtual_images(namespace.as_deref().unwrap_or_default())
            .await?;
        let by_image = images.iter().any(|image| {
            image.spec.data_source.references_disk(namespace.as_deref(), &name)
                && image.status.as_ref().is_some_and(|s| s.is_in_creation())
        });
        if by_image {
            return Ok(true);
        }

        let cluster_images = self.ctx.store.list_cluster_virtual_images().await?;
        Ok(cluster_images.iter().any(|image| {
            image.spec.data_source.references_disk(namespace.as_deref(), &name)
                && image.status.as_ref().is_some_and(|s| s.is_in_creation())
        }))
    }

    /// The claim is being exported.
    async fn used_for_export(&self, disk: &VirtualDisk) -> Result<bool> {
        let Some(claim_name) = disk.tracked_claim_name() else {
            return Ok(false);
        };
        let namespace = disk.namespace().unwrap_or_default();
        let Some(pvc) = self.ctx.store.get_claim(&namespace, claim_name).await? else {
            return Ok(false);
        };
        Ok(claim::is_bound(&pvc)
            && pvc
                .annotations()
                .get(ANNOTATION_DATA_EXPORT_REQUEST)
                .is_some_and(|v| v == "true"))
    }
}

#[async_trait]
impl ConditionScope for InUseHandler {
    type Owned = InUseReason;
    type Output = Result<Outcome>;

    async fn run(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<InUseReason>,
    ) -> Result<Outcome> {
        let name = disk.name_any();
        let namespace = disk.namespace().unwrap_or_default();

        let usage = self.machine_usage(&namespace, &name).await?;
        let current = disk
            .status
            .as_ref()
            .map(|s| s.attached_to.clone())
            .unwrap_or_default();
        let attached = attached_machines(&current, &usage);
        let facts = UsageFacts {
            attached: mounted_machine(&attached).is_some(),
            image_creation: self.used_for_image(disk).await?,
            export: self.used_for_export(disk).await?,
        };
        disk.status_mut().attached_to = attached;

        let previous = status::get(disk.conditions(), ConditionType::InUse)
            .map(|c| (c.is_true(), InUseReason::parse(&c.reason)));
        match decide(previous, &facts) {
            InUseDecision::Retain => Ok(Outcome::Continue),
            InUseDecision::Set {
                in_use,
                reason,
                stop,
            } => {
                if stop {
                    info!(name = %name, "Consumer changed, releasing the disk first");
                } else {
                    debug!(name = %name, in_use, reason = %reason, "Usage evaluated");
                }
                condition.set(in_use, reason, "");
                Ok(if stop {
                    Outcome::StopChain
                } else {
                    Outcome::Continue
                })
            }
        }
    }
}

#[async_trait]
impl Handler for InUseHandler {
    fn name(&self) -> &'static str {
        "inuse"
    }

    async fn handle(&self, disk: &mut VirtualDisk) -> Result<Outcome> {
        status::scoped(self, disk).await
    }
}
