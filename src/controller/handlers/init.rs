use async_trait::async_trait;
use kube::ResourceExt;
use tracing::debug;

use crate::controller::common::{add_finalizer, disk_finalizers};
use crate::controller::error::Result;
use crate::controller::handler::{Handler, Outcome};
use crate::crd::{FINALIZER_CLEANUP, VirtualDisk};

/// Prepares a disk for the rest of the chain.
///
/// Adds the cleanup finalizer and stages the name of the claim the disk
/// will be provisioned on.
#[derive(Default)]
pub struct InitHandler;

impl InitHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Handler for InitHandler {
    fn name(&self) -> &'static str {
        "init"
    }

    async fn handle(&self, disk: &mut VirtualDisk) -> Result<Outcome> {
        if !disk.is_deleting() && add_finalizer(disk_finalizers(disk), FINALIZER_CLEANUP) {
            debug!(name = %disk.name_any(), "Adding cleanup finalizer");
        }

        let claim = disk.supplement_name();
        let status = disk.status_mut();
        if status.target.persistent_volume_claim.is_empty() {
            status.target.persistent_volume_claim = claim;
        }
        Ok(Outcome::Continue)
    }
}
