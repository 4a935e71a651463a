//! Reconciliation loop for VirtualDisk.
//!
//! One pass reads the disk, stages a copy, runs the handler chain against
//! the copy and writes back what changed: the status sub-resource first,
//! then the finalizers. Both writes happen even when a handler failed, so
//! partial progress (a created claim name, a condition explaining the
//! failure) is never lost.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, warn};

use crate::controller::context::{Context, disk_key};
use crate::controller::error::{Error, Result};
use crate::controller::handler::{Handler, Outcome};
use crate::controller::handlers::{
    DatasourceReadyHandler, InUseHandler, InitHandler, LifecycleHandler, MigrationHandler,
    ProtectionHandler, ResizingHandler, SnapshottingHandler, StatsHandler,
    StorageClassReadyHandler,
};
use crate::controller::sources::Sources;
use crate::crd::VirtualDisk;

/// Controller label of the disk reconciler's metrics.
pub const CONTROLLER_NAME: &str = "virtualdisk";

/// Resync interval of a settled disk.
pub const DEFAULT_REQUEUE: Duration = Duration::from_secs(300);

/// Ordered handlers run once per pass.
pub struct HandlerChain {
    handlers: Vec<Box<dyn Handler>>,
}

impl HandlerChain {
    /// The disk chain: init, datasource readiness, lifecycle, storage class
    /// readiness, resizing, snapshotting, in-use, migration, protection, stats.
    pub fn new(ctx: Arc<Context>) -> Self {
        let sources = Arc::new(Sources::new(ctx.store.clone(), ctx.config.clone()));
        Self::from_handlers(vec![
            Box::new(InitHandler::new()),
            Box::new(DatasourceReadyHandler::new(sources.clone())),
            Box::new(LifecycleHandler::new(ctx.clone(), sources)),
            Box::new(StorageClassReadyHandler::new(ctx.clone())),
            Box::new(ResizingHandler::new(ctx.clone())),
            Box::new(SnapshottingHandler::new(ctx.clone())),
            Box::new(InUseHandler::new(ctx.clone())),
            Box::new(MigrationHandler::new(ctx.clone())),
            Box::new(ProtectionHandler::new()),
            Box::new(StatsHandler::new(ctx)),
        ])
    }

    pub fn from_handlers(handlers: Vec<Box<dyn Handler>>) -> Self {
        Self { handlers }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Run the handlers in order until one ends the chain or fails.
    pub async fn run(&self, disk: &mut VirtualDisk) -> Result<Outcome> {
        for handler in &self.handlers {
            let outcome = handler.handle(disk).await.inspect_err(|e| {
                debug!(handler = handler.name(), error = %e, "Handler failed");
            })?;
            if outcome.ends_chain() {
                debug!(handler = handler.name(), outcome = ?outcome, "Chain ended early");
                return Ok(outcome);
            }
        }
        Ok(Outcome::Continue)
    }
}

/// Map a pass outcome to the controller's requeue action.
pub fn to_action(outcome: Outcome) -> Action {
    match outcome {
        Outcome::Continue => Action::requeue(DEFAULT_REQUEUE),
        Outcome::RequeueAfter(delay) => Action::requeue(delay),
        Outcome::StopChain => Action::requeue(Duration::ZERO),
    }
}

/// What the controller runtime hands to every reconcile call.
pub struct Reconciler {
    pub ctx: Arc<Context>,
    chain: HandlerChain,
}

impl Reconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        let chain = HandlerChain::new(ctx.clone());
        Self { ctx, chain }
    }

    pub fn with_chain(ctx: Arc<Context>, chain: HandlerChain) -> Self {
        Self { ctx, chain }
    }

    /// One reconciliation pass over the stored disk.
    ///
    /// Returns `None` when the disk no longer exists.
    pub async fn reconcile_pass(&self, namespace: &str, name: &str) -> Result<Option<Outcome>> {
        let Some(original) = self.ctx.store.get_disk(namespace, name).await? else {
            debug!(name = %name, namespace = %namespace, "Disk is gone");
            return Ok(None);
        };

        let mut disk = original.clone();
        let result = self.chain.run(&mut disk).await;
        if result.is_ok() {
            let generation = disk.generation();
            disk.status_mut().observed_generation = Some(generation);
        }

        self.persist(&original, &disk).await?;
        result.map(Some)
    }

    async fn persist(&self, original: &VirtualDisk, disk: &VirtualDisk) -> Result<()> {
        let namespace = disk.namespace().unwrap_or_default();
        let name = disk.name_any();

        let mut resource_version = disk.resource_version();
        if disk.status != original.status {
            let Some(version) = self.ctx.store.patch_disk_status(disk).await? else {
                debug!(name = %name, namespace = %namespace, "Disk vanished before status write");
                return Ok(());
            };
            resource_version = Some(version);
        }
        if disk.finalizers() != original.finalizers() {
            self.ctx
                .store
                .patch_disk_finalizers(
                    &namespace,
                    &name,
                    disk.finalizers().to_vec(),
                    resource_version,
                )
                .await?;
        }

        if disk.phase() != original.phase()
            && let Some(health) = &self.ctx.health_state
        {
            let from = original.status.as_ref().map(|s| s.phase.to_string());
            health
                .metrics
                .record_phase_change(from.as_deref(), &disk.phase().to_string());
        }
        Ok(())
    }
}

/// Reconcile a VirtualDisk
pub async fn reconcile(disk: Arc<VirtualDisk>, reconciler: Arc<Reconciler>) -> Result<Action> {
    let start_time = Instant::now();
    let name = disk.name_any();
    let namespace = disk.namespace().unwrap_or_default();
    debug!(name = %name, namespace = %namespace, "Reconciling VirtualDisk");

    let outcome = reconciler.reconcile_pass(&namespace, &name).await?;
    let ctx = &reconciler.ctx;
    ctx.reset_failures(&disk_key(&namespace, &name));
    if let Some(health) = &ctx.health_state {
        health.metrics.record_reconcile(
            CONTROLLER_NAME,
            &namespace,
            start_time.elapsed().as_secs_f64(),
        );
        health.touch();
    }

    Ok(match outcome {
        Some(outcome) => to_action(outcome),
        None => Action::await_change(),
    })
}

/// Error policy for the controller
pub fn error_policy(disk: Arc<VirtualDisk>, error: &Error, reconciler: Arc<Reconciler>) -> Action {
    let name = disk.name_any();
    let namespace = disk.namespace().unwrap_or_default();
    let ctx = &reconciler.ctx;

    if let Some(health) = &ctx.health_state {
        health.metrics.record_error(CONTROLLER_NAME, &namespace);
    }
    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    let attempt = ctx.record_failure(&disk_key(&namespace, &name));
    let backoff = error.requeue_after(attempt);
    if error.is_retryable() {
        warn!(
            name = %name,
            namespace = %namespace,
            error = %error,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            "Retryable error, will retry with backoff"
        );
    } else {
        error!(name = %name, namespace = %namespace, error = %error, "Non-retryable error");
    }
    Action::requeue(backoff)
}
