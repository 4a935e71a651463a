//! Handler contract of the reconciliation chain.

use std::time::Duration;

use async_trait::async_trait;

use crate::controller::error::Result;
use crate::crd::VirtualDisk;

/// What a handler asks of the rest of the pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Outcome {
    /// Fall through to the next handler.
    #[default]
    Continue,
    /// Finish the pass now and run the next one no sooner than the delay.
    RequeueAfter(Duration),
    /// State changed in a way later handlers cannot observe in this pass:
    /// abandon the chain and reconcile again right away.
    StopChain,
}

impl Outcome {
    pub fn ends_chain(&self) -> bool {
        !matches!(self, Outcome::Continue)
    }

    /// Keep the more urgent of two outcomes.
    ///
    /// A stop beats any delay, a shorter delay beats a longer one.
    pub fn merge(self, other: Outcome) -> Outcome {
        match (self, other) {
            (Outcome::StopChain, _) | (_, Outcome::StopChain) => Outcome::StopChain,
            (Outcome::RequeueAfter(a), Outcome::RequeueAfter(b)) => Outcome::RequeueAfter(a.min(b)),
            (Outcome::RequeueAfter(d), Outcome::Continue)
            | (Outcome::Continue, Outcome::RequeueAfter(d)) => Outcome::RequeueAfter(d),
            (Outcome::Continue, Outcome::Continue) => Outcome::Continue,
        }
    }
}

/// One independent concern of a reconciliation pass.
///
/// Handlers mutate the staged copy of the disk; the chain persists it.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, disk: &mut VirtualDisk) -> Result<Outcome>;
}
