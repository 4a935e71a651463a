//! Shared context for the controllers.
//!
//! The Context struct holds what a reconciliation pass needs besides the
//! disk itself: the object store, the event publisher, the operator
//! configuration and the health state. It holds no client so that passes
//! can run against any [`DiskStore`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};

#[cfg(test)]
use mockall::automock;

use crate::config::OperatorConfig;
use crate::crd::VirtualDisk;
use crate::health::HealthState;
use crate::store::DiskStore;

/// Reporting controller name of published events
pub const REPORTER: &str = "vdisk-operator";

/// Publishes Kubernetes events about disks.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        disk: &VirtualDisk,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Event publisher backed by the events API.
pub struct KubeEventPublisher {
    client: Client,
    reporter: Reporter,
}

impl KubeEventPublisher {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: REPORTER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }

    /// Create an event recorder for publishing Kubernetes events
    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        disk: &VirtualDisk,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let object_ref = disk.object_ref(&());
        if let Err(e) = self
            .recorder()
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }
}

/// An event captured by [`RecordingPublisher`].
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    pub disk: String,
    pub warning: bool,
    pub reason: String,
    pub note: Option<String>,
}

/// Event publisher keeping events in memory.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(
        &self,
        disk: &VirtualDisk,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        if let Ok(mut events) = self.events.lock() {
            events.push(RecordedEvent {
                disk: disk.name_any(),
                warning: type_ == EventType::Warning,
                reason: reason.to_string(),
                note,
            });
        }
    }
}

/// Shared context for the controllers
pub struct Context {
    pub store: Arc<dyn DiskStore>,
    pub events: Arc<dyn EventPublisher>,
    pub config: Arc<OperatorConfig>,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
    /// Consecutive failed passes per disk, for the retry backoff
    failures: Mutex<HashMap<String, u32>>,
}

impl Context {
    /// Create a new context
    pub fn new(
        store: Arc<dyn DiskStore>,
        events: Arc<dyn EventPublisher>,
        config: OperatorConfig,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            store,
            events,
            config: Arc::new(config),
            health_state,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Publish a normal event for a disk
    pub async fn publish_normal_event(
        &self,
        disk: &VirtualDisk,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.events
            .publish(disk, EventType::Normal, reason, action, note)
            .await;
    }

    /// Publish a warning event for a disk
    pub async fn publish_warning_event(
        &self,
        disk: &VirtualDisk,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.events
            .publish(disk, EventType::Warning, reason, action, note)
            .await;
    }

    /// Count one more failed pass for `key`, returning the new count.
    pub fn record_failure(&self, key: &str) -> u32 {
        let Ok(mut failures) = self.failures.lock() else {
            return 1;
        };
        let count = failures.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Forget the failures of `key` after a successful pass.
    pub fn reset_failures(&self, key: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(key);
        }
    }
}

/// Key identifying a disk in per-disk bookkeeping.
pub fn disk_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}
