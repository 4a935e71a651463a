//! Withdraws pending relocations once a class change is undone.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::info;

use crate::controller::attachment::mounted_machine;
use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::controller::handler::{Handler, Outcome};
use crate::crd::{OperationType, VirtualDisk};
use crate::resources::operation::is_volume_migration;

pub struct CancelHandler {
    ctx: Arc<Context>,
}

impl CancelHandler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

/// The migration in progress moves the disk to a class that is no longer
/// declared: the declaration went back to the class the disk lives on.
pub fn is_unwanted(disk: &VirtualDisk) -> bool {
    let Some(state) = disk.migration_state().filter(|s| s.is_in_progress()) else {
        return false;
    };
    let provisioned = disk.provisioned_storage_class();
    let declared = disk.declared_storage_class();
    declared.is_some()
        && declared == provisioned
        && state.target_storage_class.as_deref() != provisioned
}

#[async_trait]
impl Handler for CancelHandler {
    fn name(&self) -> &'static str {
        "cancel"
    }

    async fn handle(&self, disk: &mut VirtualDisk) -> Result<Outcome> {
        if !is_unwanted(disk) {
            return Ok(Outcome::Continue);
        }
        let Some(machine) = disk
            .status
            .as_ref()
            .and_then(|s| mounted_machine(&s.attached_to))
            .map(String::from)
        else {
            return Ok(Outcome::Continue);
        };

        let namespace = disk.namespace().unwrap_or_default();
        let store = self.ctx.store.as_ref();
        for op in store.list_operations(&namespace).await? {
            if op.spec.virtual_machine_name != machine
                || op.spec.r#type != OperationType::Evict
                || !is_volume_migration(&op)
                || !op.is_in_flight()
            {
                continue;
            }
            let op_name = op.name_any();
            info!(name = %disk.name_any(), machine = %machine, operation = %op_name, "Cancelling relocation");
            store.delete_operation(&namespace, &op_name).await?;
            self.ctx
                .publish_normal_event(
                    disk,
                    "VolumeMigration",
                    "Cancel",
                    Some(format!("Relocation {op_name} cancelled, the storage class change was undone")),
                )
                .await;
        }
        Ok(Outcome::Continue)
    }
}
