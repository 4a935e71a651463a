//! First-applicable-step-wins execution of provisioning pipelines.
//!
//! A pipeline is an ordered list of steps consulted once per pass. A step
//! either declines (`Ok(None)`) and hands over to the next one, or settles
//! the pass with an [`Outcome`]. A pipeline that falls off the end lets the
//! handler chain continue.

use async_trait::async_trait;

use crate::controller::error::Result;
use crate::controller::handler::Outcome;
use crate::controller::status::ConditionBuilder;
use crate::crd::{ReadyReason, VirtualDisk};

/// One decision of a provisioning pipeline.
///
/// Steps receive the Ready condition of the pass: they are the only writers
/// of it while the pipeline runs.
#[async_trait]
pub trait Step: Send + Sync {
    async fn take(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<ReadyReason>,
    ) -> Result<Option<Outcome>>;
}

/// Ordered list of steps.
#[derive(Default)]
pub struct StepPipeline {
    steps: Vec<Box<dyn Step>>,
}

impl StepPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step.
    pub fn then(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run steps in order until one settles the pass.
    pub async fn run(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<ReadyReason>,
    ) -> Result<Outcome> {
        for step in &self.steps {
            if let Some(outcome) = step.take(disk, condition).await? {
                return Ok(outcome);
            }
        }
        Ok(Outcome::Continue)
    }
}
