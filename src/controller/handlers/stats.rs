use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::info;

use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::controller::handler::{Handler, Outcome};
use crate::controller::status;
use crate::crd::{ConditionType, VirtualDisk};

/// Records how long provisioning took, once.
pub struct StatsHandler {
    ctx: Arc<Context>,
}

impl StatsHandler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

/// Seconds from creation until `now`, never negative.
fn seconds_since_creation(disk: &VirtualDisk, now: jiff::Timestamp) -> Option<i64> {
    let created = disk.metadata.creation_timestamp.as_ref()?.0;
    Some(now.duration_since(created).as_secs().max(0))
}

#[async_trait]
impl Handler for StatsHandler {
    fn name(&self) -> &'static str {
        "stats"
    }

    async fn handle(&self, disk: &mut VirtualDisk) -> Result<Outcome> {
        if !status::is_true(disk.conditions(), ConditionType::Ready) {
            return Ok(Outcome::Continue);
        }
        if disk
            .status
            .as_ref()
            .is_some_and(|s| s.stats.creation_duration.is_some())
        {
            return Ok(Outcome::Continue);
        }
        let Some(seconds) = seconds_since_creation(disk, jiff::Timestamp::now()) else {
            return Ok(Outcome::Continue);
        };

        info!(name = %disk.name_any(), seconds, "Disk provisioned");
        disk.status_mut().stats.creation_duration = Some(format!("{seconds}s"));
        if let Some(health) = &self.ctx.health_state {
            health.metrics.record_provisioning(seconds as f64);
        }
        Ok(Outcome::Continue)
    }
}
