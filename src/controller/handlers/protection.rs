use async_trait::async_trait;
use kube::ResourceExt;
use tracing::info;

use crate::controller::common::{add_finalizer, disk_finalizers, remove_finalizer};
use crate::controller::error::Result;
use crate::controller::handler::{Handler, Outcome};
use crate::crd::{FINALIZER_PROTECTION, VirtualDisk};

/// Keeps an attached disk from being deleted under its machines.
#[derive(Default)]
pub struct ProtectionHandler;

impl ProtectionHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Handler for ProtectionHandler {
    fn name(&self) -> &'static str {
        "protection"
    }

    async fn handle(&self, disk: &mut VirtualDisk) -> Result<Outcome> {
        let attached = disk
            .status
            .as_ref()
            .is_some_and(|s| !s.attached_to.is_empty());
        let deleting = disk.is_deleting();
        let name = disk.name_any();

        if attached {
            if !deleting && add_finalizer(disk_finalizers(disk), FINALIZER_PROTECTION) {
                info!(name = %name, "Disk attached, protecting from deletion");
            }
        } else if remove_finalizer(disk_finalizers(disk), FINALIZER_PROTECTION) {
            info!(name = %name, "Disk released, protection removed");
        }
        Ok(Outcome::Continue)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::*;
    use crate::crd::{AttachedVirtualMachine, VirtualDiskSpec};

    fn attached_disk() -> VirtualDisk {
        let mut disk = VirtualDisk::new("root", VirtualDiskSpec::default());
        disk.status_mut().attached_to = vec![AttachedVirtualMachine {
            name: "vm".to_string(),
            mounted: true,
        }];
        disk
    }

    #[tokio::test]
    async fn test_attached_disk_protected_until_released() {
        let mut disk = attached_disk();
        ProtectionHandler::new().handle(&mut disk).await.unwrap();
        assert_eq!(disk.finalizers(), [FINALIZER_PROTECTION.to_string()]);

        disk.status_mut().attached_to.clear();
        ProtectionHandler::new().handle(&mut disk).await.unwrap();
        assert!(disk.finalizers().is_empty());
    }

    #[tokio::test]
    async fn test_deleting_disk_not_protected_again() {
        let mut disk = attached_disk();
        disk.metadata.deletion_timestamp = Some(Time(jiff::Timestamp::now()));
        ProtectionHandler::new().handle(&mut disk).await.unwrap();
        assert!(disk.finalizers().is_empty());
    }
}
