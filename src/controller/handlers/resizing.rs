use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::info;

use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::controller::handler::{Handler, Outcome};
use crate::controller::sources::provisioning_claim_name;
use crate::controller::status::{self, ConditionBuilder, ConditionScope};
use crate::crd::{ConditionType, DiskPhase, ResizingReason, VirtualDisk};
use crate::quantity::parse_bytes;
use crate::resources::claim;

/// Owns Resizing: grows the claim of a ready disk to the declared size.
pub struct ResizingHandler {
    ctx: Arc<Context>,
}

impl ResizingHandler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ConditionScope for ResizingHandler {
    type Owned = ResizingReason;
    type Output = Result<Outcome>;

    async fn run(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<ResizingReason>,
    ) -> Result<Outcome> {
        if disk.is_deleting() || !status::is_true(disk.conditions(), ConditionType::Ready) {
            condition.remove();
            return Ok(Outcome::Continue);
        }
        let Some(declared) = disk.declared_size().map(String::from) else {
            condition.remove();
            return Ok(Outcome::Continue);
        };

        let namespace = disk.namespace().unwrap_or_default();
        let claim_name = provisioning_claim_name(disk);
        let Some(pvc) = self.ctx.store.get_claim(&namespace, &claim_name).await? else {
            condition.remove();
            return Ok(Outcome::Continue);
        };
        if !claim::is_bound(&pvc) {
            condition.remove();
            return Ok(Outcome::Continue);
        }
        let Some(requested) = claim::requested_size(&pvc).map(String::from) else {
            condition.remove();
            return Ok(Outcome::Continue);
        };

        match parse_bytes(&declared)?.cmp(&parse_bytes(&requested)?) {
            Ordering::Less => {
                condition.set_false(
                    ResizingReason::ShrinkNotAllowed,
                    format!("The virtual disk size is too low: should be >= {requested}"),
                );
            }
            Ordering::Greater => {
                if disk.is_migrating() {
                    condition.set_false(
                        ResizingReason::ResizingNotAvailable,
                        "The virtual disk cannot be resized while it is being migrated",
                    );
                } else if status::is_true(disk.conditions(), ConditionType::Snapshotting) {
                    condition.set_false(
                        ResizingReason::ResizingNotAvailable,
                        "The virtual disk cannot be resized while it is being snapshotted",
                    );
                } else {
                    info!(name = %disk.name_any(), from = %requested, to = %declared, "Expanding claim");
                    self.ctx
                        .store
                        .patch_claim_size(&namespace, &claim_name, declared)
                        .await?;
                    disk.status_mut().phase = DiskPhase::Resizing;
                    condition.set_true(ResizingReason::InProgress, "The virtual disk is being resized");
                }
            }
            Ordering::Equal => {
                let capacity = claim::capacity(&pvc).map(String::from);
                let reached = match capacity.as_deref() {
                    Some(capacity) => parse_bytes(capacity)? >= parse_bytes(&requested)?,
                    None => false,
                };
                if reached {
                    let status = disk.status_mut();
                    status.capacity = capacity;
                    if status.phase == DiskPhase::Resizing {
                        status.phase = DiskPhase::Ready;
                    }
                    condition.remove();
                } else {
                    disk.status_mut().phase = DiskPhase::Resizing;
                    condition.set_true(ResizingReason::InProgress, "The virtual disk is being resized");
                }
            }
        }
        Ok(Outcome::Continue)
    }
}

#[async_trait]
impl Handler for ResizingHandler {
    fn name(&self) -> &'static str {
        "resizing"
    }

    async fn handle(&self, disk: &mut VirtualDisk) -> Result<Outcome> {
        status::scoped(self, disk).await
    }
}
