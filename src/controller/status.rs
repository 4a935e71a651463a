//! Condition set management.
//!
//! Conditions are upserted by type: at most one condition per type exists
//! in a status, and every write stamps the disk's current generation.
//!
//! Handlers never write conditions directly. Each handler owns one
//! condition type and holds a [`ConditionBuilder`] for it while it runs;
//! the builder is committed once when the handler exits, whatever the exit
//! path was (see [`scoped`]).

use std::str::FromStr;

use async_trait::async_trait;

use crate::crd::{Condition, ConditionStatus, ConditionType, Reason, VirtualDisk};

/// Find the condition of a type.
pub fn get(conditions: &[Condition], condition_type: ConditionType) -> Option<&Condition> {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type.as_str())
}

/// Add or update a condition.
///
/// The transition time is only moved when the status changes.
pub fn set(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.r#type == condition.r#type)
    {
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time.clone();
        }
        *existing = condition;
    } else {
        conditions.push(condition);
    }
}

/// Drop the condition of a type.
pub fn remove(conditions: &mut Vec<Condition>, condition_type: ConditionType) {
    conditions.retain(|c| c.r#type != condition_type.as_str());
}

/// Check if a condition type is true
pub fn is_true(conditions: &[Condition], condition_type: ConditionType) -> bool {
    get(conditions, condition_type).is_some_and(Condition::is_true)
}

/// Parsed reason of the condition owned by `R`.
pub fn reason<R>(conditions: &[Condition]) -> Option<R>
where
    R: Reason + FromStr,
{
    get(conditions, R::CONDITION_TYPE).and_then(|c| c.reason.parse().ok())
}

/// Normalize a human message: first letter capitalized, ends with a period.
pub fn message(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }
    let mut chars = text.chars();
    let mut out: String = chars
        .next()
        .map(|first| first.to_uppercase().chain(chars).collect())
        .unwrap_or_default();
    if !out.ends_with(['.', '!', '?']) {
        out.push('.');
    }
    out
}

#[derive(Clone, Debug, PartialEq)]
enum Pending<R> {
    Untouched,
    Set {
        status: ConditionStatus,
        reason: R,
        message: String,
    },
    Remove,
}

/// Builder for the one condition a handler owns.
///
/// Nothing is written unless the handler sets or removes the condition.
#[derive(Clone, Debug)]
pub struct ConditionBuilder<R: Reason> {
    generation: i64,
    pending: Pending<R>,
}

impl<R: Reason> ConditionBuilder<R> {
    pub fn new(generation: i64) -> Self {
        Self {
            generation,
            pending: Pending::Untouched,
        }
    }

    /// Stage the condition.
    pub fn set(
        &mut self,
        status: impl Into<ConditionStatus>,
        reason: R,
        text: impl AsRef<str>,
    ) -> &mut Self {
        self.pending = Pending::Set {
            status: status.into(),
            reason,
            message: message(text.as_ref()),
        };
        self
    }

    pub fn set_true(&mut self, reason: R, text: impl AsRef<str>) -> &mut Self {
        self.set(ConditionStatus::True, reason, text)
    }

    pub fn set_false(&mut self, reason: R, text: impl AsRef<str>) -> &mut Self {
        self.set(ConditionStatus::False, reason, text)
    }

    /// Stage removal of the condition.
    pub fn remove(&mut self) -> &mut Self {
        self.pending = Pending::Remove;
        self
    }

    pub fn is_untouched(&self) -> bool {
        self.pending == Pending::Untouched
    }

    /// Staged status, if any.
    pub fn status(&self) -> Option<ConditionStatus> {
        match &self.pending {
            Pending::Set { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Staged reason, if any.
    pub fn reason(&self) -> Option<&R> {
        match &self.pending {
            Pending::Set { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Write the staged value into a condition list.
    pub fn commit(self, conditions: &mut Vec<Condition>) {
        match self.pending {
            Pending::Untouched => {}
            Pending::Remove => remove(conditions, R::CONDITION_TYPE),
            Pending::Set {
                status,
                reason,
                message,
            } => set(
                conditions,
                Condition::new(
                    R::CONDITION_TYPE.as_str(),
                    status,
                    reason.as_str(),
                    &message,
                    Some(self.generation),
                ),
            ),
        }
    }
}

/// A unit of work owning one condition type.
///
/// [`scoped`] hands it a fresh builder and commits the builder into the
/// disk's conditions on every exit path, errors included.
#[async_trait]
pub trait ConditionScope: Send + Sync {
    type Owned: Reason + 'static;
    type Output: Send;

    async fn run(
        &self,
        disk: &mut VirtualDisk,
        condition: &mut ConditionBuilder<Self::Owned>,
    ) -> Self::Output;
}

/// Run a scope and commit its condition.
pub async fn scoped<S: ConditionScope + ?Sized>(scope: &S, disk: &mut VirtualDisk) -> S::Output {
    let mut condition = ConditionBuilder::new(disk.generation());
    let output = scope.run(disk, &mut condition).await;
    condition.commit(&mut disk.status_mut().conditions);
    output
}
