use std::sync::Arc;

use async_trait::async_trait;

use crate::controller::error::Result;
use crate::controller::handler::{Handler, Outcome};
use crate::controller::sources::Sources;
use crate::controller::status::{self, ConditionBuilder, ConditionScope};
use crate::crd::{DatasourceReadyReason, VirtualDisk};

/// Owns DatasourceReady: whether the declared source can be provisioned from.
pub struct DatasourceReadyHandler {
    sources: Arc<Sources>,
}

impl DatasourceReadyHandler {
    pub fn new(sources: Arc<Sources>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl ConditionScope for DatasourceReadyHandler {
    type Owned = DatasourceReadyReason;
    type Output = Result<Outcome>;

    async fn run(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<DatasourceReadyReason>,
    ) -> Result<Outcome> {
        if disk.is_deleting() {
            return Ok(Outcome::Continue);
        }
        match self.sources.for_disk(disk).validate(disk).await? {
            None => {
                condition.set_true(DatasourceReadyReason::DatasourceReady, "");
            }
            Some(failure) => {
                condition.set_false(failure.reason, failure.message);
            }
        }
        Ok(Outcome::Continue)
    }
}

#[async_trait]
impl Handler for DatasourceReadyHandler {
    fn name(&self) -> &'static str {
        "datasource-ready"
    }

    async fn handle(&self, disk: &mut VirtualDisk) -> Result<Outcome> {
        status::scoped(self, disk).await
    }
}
