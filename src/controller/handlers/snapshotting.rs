use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;

use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::controller::handler::{Handler, Outcome};
use crate::controller::status::{self, ConditionBuilder, ConditionScope};
use crate::crd::{SnapshottingReason, VirtualDisk};

/// Owns Snapshotting: true while a snapshot of the disk is being taken.
pub struct SnapshottingHandler {
    ctx: Arc<Context>,
}

impl SnapshottingHandler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ConditionScope for SnapshottingHandler {
    type Owned = SnapshottingReason;
    type Output = Result<Outcome>;

    async fn run(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<SnapshottingReason>,
    ) -> Result<Outcome> {
        let name = disk.name_any();
        let snapshots = self
            .ctx
            .store
            .list_disk_snapshots(&disk.namespace().unwrap_or_default())
            .await?;
        let taking = snapshots
            .iter()
            .find(|s| s.spec.virtual_disk_name == name && s.is_in_progress());

        match taking {
            Some(snapshot) => {
                condition.set_true(
                    SnapshottingReason::InProgress,
                    format!("The virtual disk is being snapshotted by {}", snapshot.name_any()),
                );
            }
            None => {
                condition.remove();
            }
        }
        Ok(Outcome::Continue)
    }
}

#[async_trait]
impl Handler for SnapshottingHandler {
    fn name(&self) -> &'static str {
        "snapshotting"
    }

    async fn handle(&self, disk: &mut VirtualDisk) -> Result<Outcome> {
        status::scoped(self, disk).await
    }
}
