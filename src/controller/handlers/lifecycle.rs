//! Provisioning lifecycle of a disk.
//!
//! Owns the Ready condition (and QuotaNotExceeded, which mirrors it). On
//! deletion it cleans up what provisioning left behind; otherwise it checks
//! the preconditions of provisioning and hands over to the data source.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::common::{disk_finalizers, remove_finalizer, unprotect_claim};
use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::controller::handler::{Handler, Outcome};
use crate::controller::sources::{Sources, is_provisioning_finished, provisioning_claim_name};
use crate::controller::status::{self, ConditionBuilder, ConditionScope};
use crate::controller::storage_class::StorageClassService;
use crate::crd::{
    ConditionType, DatasourceReadyReason, DiskPhase, FINALIZER_CLEANUP,
    QuotaNotExceededReason, ReadyReason, VirtualDisk,
};
use crate::resources::claim;

/// Poll interval while supplements are being deleted.
const CLEANUP_REQUEUE: Duration = Duration::from_secs(1);

pub struct LifecycleHandler {
    ctx: Arc<Context>,
    sources: Arc<Sources>,
    classes: StorageClassService,
}

impl LifecycleHandler {
    pub fn new(ctx: Arc<Context>, sources: Arc<Sources>) -> Self {
        let classes = StorageClassService::new(ctx.store.clone(), ctx.config.clone());
        Self {
            ctx,
            sources,
            classes,
        }
    }

    async fn handle_deletion(&self, disk: &mut VirtualDisk) -> Result<Outcome> {
        let name = disk.name_any();
        let namespace = disk.namespace().unwrap_or_default();
        disk.status_mut().phase = DiskPhase::Terminating;

        if self.sources.clean_up(disk).await? {
            debug!(name = %name, "Waiting for supplements to be deleted");
            return Ok(Outcome::RequeueAfter(CLEANUP_REQUEUE));
        }

        let mut claims: Vec<String> = disk.tracked_claim_name().map(String::from).into_iter().collect();
        if let Some(state) = disk.migration_state() {
            claims.extend(
                [&state.source_pvc, &state.target_pvc]
                    .into_iter()
                    .filter(|c| !c.is_empty())
                    .cloned(),
            );
        }
        claims.sort();
        claims.dedup();
        for claim_name in claims {
            if let Some(pvc) = self.ctx.store.get_claim(&namespace, &claim_name).await? {
                unprotect_claim(self.ctx.store.as_ref(), &pvc).await?;
            }
        }

        if remove_finalizer(disk_finalizers(disk), FINALIZER_CLEANUP) {
            info!(name = %name, "Cleanup finished, removing finalizer");
        }
        Ok(Outcome::Continue)
    }

    /// The declared spec changed while provisioning had not finished yet.
    fn needs_restart(disk: &VirtualDisk) -> bool {
        let generation = disk.generation();
        let observed = disk.status.as_ref().and_then(|s| s.observed_generation);
        generation > 1 && observed != Some(generation) && !is_provisioning_finished(disk)
    }

    async fn restart(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<ReadyReason>,
    ) -> Result<Outcome> {
        info!(name = %disk.name_any(), generation = disk.generation(), "Spec changed, restarting provisioning");
        self.sources.clean_up(disk).await?;

        let status = disk.status_mut();
        status.phase = DiskPhase::Pending;
        status.progress = None;
        status.capacity = None;
        condition.set_false(
            ReadyReason::ProvisioningNotStarted,
            "The specification has changed, provisioning restarts",
        );
        Ok(Outcome::StopChain)
    }

    /// Storage class to provision on, or a reason why there is none yet.
    async fn provisioning_class(
        &self,
        disk: &VirtualDisk,
    ) -> Result<std::result::Result<Option<StorageClass>, String>> {
        let namespace = disk.namespace().unwrap_or_default();
        let existing = self
            .ctx
            .store
            .get_claim(&namespace, &provisioning_claim_name(disk))
            .await?;

        if let Some(pvc) = existing {
            return match claim::storage_class(&pvc) {
                Some(name) => Ok(Ok(self.classes.get(name).await?)),
                None => Ok(Ok(None)),
            };
        }
        if is_provisioning_finished(disk) {
            return Ok(Ok(None));
        }

        let Some(name) = self.classes.resolve_name(disk).await? else {
            return Ok(Err(
                "No default StorageClass found in the cluster: please specify the storage class name in the virtual disk specification"
                    .to_string(),
            ));
        };
        let check = self.classes.check(&name).await?;
        match check.usable() {
            Some(class) => Ok(Ok(Some(class.clone()))),
            None => Ok(Err(check.message())),
        }
    }
}

#[async_trait]
impl ConditionScope for LifecycleHandler {
    type Owned = ReadyReason;
    type Output = Result<Outcome>;

    async fn run(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<ReadyReason>,
    ) -> Result<Outcome> {
        if disk.is_deleting() {
            return self.handle_deletion(disk).await;
        }
        if Self::needs_restart(disk) {
            return self.restart(disk, condition).await;
        }

        if !is_provisioning_finished(disk) {
            let source = status::get(disk.conditions(), ConditionType::DatasourceReady);
            if !source.is_some_and(|c| c.is_true()) {
                let message = source.map(|c| c.message.clone()).unwrap_or_default();
                let reason = match status::reason::<DatasourceReadyReason>(disk.conditions()) {
                    Some(
                        DatasourceReadyReason::ImageNotFound
                        | DatasourceReadyReason::ClusterImageNotFound,
                    ) => ReadyReason::DatasourceIsNotFound,
                    _ => ReadyReason::DatasourceIsNotReady,
                };
                disk.status_mut().phase = DiskPhase::Pending;
                condition.set_false(reason, message);
                return Ok(Outcome::Continue);
            }
        }

        let class = match self.provisioning_class(disk).await? {
            Ok(class) => class,
            Err(message) => {
                disk.status_mut().phase = DiskPhase::Pending;
                condition.set_false(ReadyReason::StorageClassIsNotReady, message);
                return Ok(Outcome::Continue);
            }
        };

        let source = self.sources.for_disk(disk);
        debug!(name = %disk.name_any(), source = source.name(), "Syncing data source");
        source.sync(disk, condition, class.as_ref()).await
    }
}

#[async_trait]
impl Handler for LifecycleHandler {
    fn name(&self) -> &'static str {
        "lifecycle"
    }

    async fn handle(&self, disk: &mut VirtualDisk) -> Result<Outcome> {
        let outcome = status::scoped(self, disk).await;
        if disk.is_deleting() {
            return outcome;
        }

        let mut quota = ConditionBuilder::<QuotaNotExceededReason>::new(disk.generation());
        match status::get(disk.conditions(), ConditionType::Ready) {
            Some(ready) if ready.reason == ReadyReason::QuotaExceeded.to_string() => {
                let message = ready.message.clone();
                quota.set_false(QuotaNotExceededReason::QuotaExceeded, message);
            }
            _ => {
                quota.set_true(QuotaNotExceededReason::QuotaNotExceeded, "");
            }
        }
        quota.commit(&mut disk.status_mut().conditions);
        outcome
    }
}
