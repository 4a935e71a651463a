//! vdisk-operator library crate
//!
//! This module exports the controllers, CRD definitions, the object store
//! and the resource generators.

pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod quantity;
pub mod resources;
pub mod store;

pub use config::OperatorConfig;
pub use health::HealthState;

use std::sync::Arc;

use futures::{Stream, StreamExt, future};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{Controller, WatchStreamExt, predicates, reflector, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use controller::context::{Context, KubeEventPublisher};
use controller::reconciler::Reconciler;
use controller::volume_migration::VolumeMigrationReconciler;
use crd::{
    ClusterVirtualImage, DataVolume, ObjectRefKind, VirtualDisk, VirtualImage, VirtualMachine,
};
use store::KubeStore;

/// Create namespaced or cluster-wide API based on scope
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Watcher configuration shared by both controllers.
fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Create a reflector-backed stream that drops status-only updates.
///
/// Returns the reflector store (for cache lookups) and the filtered stream.
fn create_filtered_stream<K>(
    api: Api<K>,
    watcher_config: WatcherConfig,
) -> (
    reflector::Store<K>,
    impl Stream<Item = Result<K, watcher::Error>>,
)
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher_config))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicates::generation, Default::default());
    (reader, stream)
}

/// Disks a machine references, in the machine's namespace.
fn disks_of_machine(machine: VirtualMachine) -> Vec<ObjectRef<VirtualDisk>> {
    let namespace = machine.namespace().unwrap_or_default();
    machine
        .referenced_disks()
        .into_iter()
        .map(|name| ObjectRef::new(&name).within(&namespace))
        .collect()
}

/// The disk an image is built from, if any.
fn disk_of_image(
    source: Option<&crd::ImageObjectRef>,
    image_namespace: Option<String>,
) -> Option<ObjectRef<VirtualDisk>> {
    let source = source.filter(|r| r.kind == "VirtualDisk")?;
    let namespace = source.namespace.clone().or(image_namespace)?;
    Some(ObjectRef::new(&source.name).within(&namespace))
}

/// Disks whose data source names the given object.
fn disks_sourced_from<'a>(
    disks: impl IntoIterator<Item = &'a VirtualDisk>,
    kind: ObjectRefKind,
    name: &str,
    namespace: Option<&str>,
) -> Vec<ObjectRef<VirtualDisk>> {
    disks
        .into_iter()
        .filter(|disk| {
            disk.spec
                .data_source
                .as_ref()
                .and_then(|source| source.object_ref.as_ref())
                .is_some_and(|r| r.kind == kind && r.name == name)
        })
        .filter(|disk| namespace.is_none() || disk.namespace().as_deref() == namespace)
        .map(ObjectRef::from_obj)
        .collect()
}

/// Log the result of one reconciliation.
async fn log_result<E: std::fmt::Debug>(
    result: Result<
        (ObjectRef<VirtualDisk>, kube::runtime::controller::Action),
        kube::runtime::controller::Error<controller::error::Error, E>,
    >,
) {
    match result {
        Ok((obj, _action)) => {
            debug!("Reconciled: {}", obj.name);
        }
        Err(e) => {
            // Watch events of related objects can name a disk that is gone.
            let is_not_found = match &e {
                kube::runtime::controller::Error::ObjectNotFound(_) => true,
                kube::runtime::controller::Error::ReconcilerFailed(err, _) => err.is_not_found(),
                _ => false,
            };
            if is_not_found {
                debug!("Object no longer exists (likely deleted): {:?}", e);
            } else {
                error!("Reconciliation error: {:?}", e);
            }
        }
    }
}

/// Run the VirtualDisk controller and, when enabled, the volume migration
/// orchestrator, until their streams end.
///
/// Both are scoped to `config.watch_namespace` when it is set.
pub async fn run_controllers(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
) {
    let namespace = config.watch_namespace.clone();
    let namespace = namespace.as_deref();
    info!(
        "Starting controllers for VirtualDisk resources (scope: {})",
        namespace.unwrap_or("cluster-wide")
    );

    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let migration_enabled = config.volume_migration_enabled;
    let ctx = Arc::new(Context::new(
        Arc::new(KubeStore::new(client.clone())),
        Arc::new(KubeEventPublisher::new(client.clone())),
        config,
        health_state,
    ));

    let disk_controller = run_disk_controller(client.clone(), ctx.clone(), namespace);
    if migration_enabled {
        let orchestrator = run_volume_migration_controller(client, ctx, namespace);
        future::join(disk_controller, orchestrator).await;
    } else {
        info!("Volume migration disabled, orchestrator not started");
        disk_controller.await;
    }

    // This should never complete in normal operation
    error!("Controller streams ended unexpectedly");
}

/// Run the VirtualDisk controller.
///
/// Besides the disks themselves it reacts to the claims and import jobs the
/// disks own, to machines referencing a disk, and to images either built
/// from a disk or feeding one.
pub async fn run_disk_controller(client: Client, ctx: Arc<Context>, namespace: Option<&str>) {
    let disks: Api<VirtualDisk> = scoped_api(client.clone(), namespace);
    let claims: Api<PersistentVolumeClaim> = scoped_api(client.clone(), namespace);
    let data_volumes: Api<DataVolume> = scoped_api(client.clone(), namespace);
    let machines: Api<VirtualMachine> = scoped_api(client.clone(), namespace);
    let images: Api<VirtualImage> = scoped_api(client.clone(), namespace);
    let cluster_images: Api<ClusterVirtualImage> = Api::all(client);

    let watcher_config = default_watcher_config();
    let (reader, disk_stream) = create_filtered_stream(disks, watcher_config.clone());
    let reconciler = Arc::new(Reconciler::new(ctx));
    let image_cache = reader.clone();
    let cluster_image_cache = reader.clone();

    // Claims and import jobs carry status the chain reads, so they are
    // watched in full rather than through their metadata.
    Controller::for_stream(disk_stream, reader)
        .owns(claims, watcher_config.clone())
        .owns(data_volumes, watcher_config.clone())
        .watches(machines, watcher_config.clone(), disks_of_machine)
        .watches(images, watcher_config.clone(), move |image: VirtualImage| {
            let namespace = image.namespace();
            let disks = image_cache.state();
            let mut refs = disks_sourced_from(
                disks.iter().map(AsRef::as_ref),
                ObjectRefKind::VirtualImage,
                &image.name_any(),
                namespace.as_deref(),
            );
            refs.extend(disk_of_image(image.spec.data_source.object_ref.as_ref(), namespace));
            refs
        })
        .watches(cluster_images, watcher_config, move |image: ClusterVirtualImage| {
            let disks = cluster_image_cache.state();
            let mut refs = disks_sourced_from(
                disks.iter().map(AsRef::as_ref),
                ObjectRefKind::ClusterVirtualImage,
                &image.name_any(),
                None,
            );
            refs.extend(disk_of_image(image.spec.data_source.object_ref.as_ref(), None));
            refs
        })
        .run(
            controller::reconciler::reconcile,
            controller::reconciler::error_policy,
            reconciler,
        )
        .for_each(log_result)
        .await;
}

/// Run the volume migration orchestrator.
///
/// Unlike the disk controller it must see status-only updates: the
/// Migrating condition is what sets it in motion.
pub async fn run_volume_migration_controller(
    client: Client,
    ctx: Arc<Context>,
    namespace: Option<&str>,
) {
    let disks: Api<VirtualDisk> = scoped_api(client.clone(), namespace);
    let machines: Api<VirtualMachine> = scoped_api(client, namespace);
    let watcher_config = default_watcher_config();
    let reconciler = Arc::new(VolumeMigrationReconciler::new(ctx));

    Controller::new(disks, watcher_config.clone())
        .watches(machines, watcher_config, disks_of_machine)
        .run(
            controller::volume_migration::reconcile,
            controller::volume_migration::error_policy,
            reconciler,
        )
        .for_each(log_result)
        .await;
}
