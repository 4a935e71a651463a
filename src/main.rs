//! vdisk-operator entry point.
//!
//! Sets up JSON logging, reads the configuration, serves probes and
//! metrics, and runs the controllers once this replica holds the lease.

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use tokio::signal;
use tracing::{error, info, warn};

use vdisk_operator::OperatorConfig;
use vdisk_operator::health::{HealthState, run_health_server};
use vdisk_operator::run_controllers;

const LEASE_NAME: &str = "vdisk-operator-leader";
const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Time given to in-flight passes before the process exits.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Who this replica is when competing for the lease.
struct Identity {
    holder: String,
    namespace: String,
}

impl Identity {
    fn from_env() -> Self {
        let holder = std::env::var("POD_NAME").unwrap_or_else(|_| {
            warn!("POD_NAME not set, using hostname");
            hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string())
        });
        let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
            warn!("POD_NAMESPACE not set, using 'default'");
            "default".to_string()
        });
        Self { holder, namespace }
    }

    fn lease(&self, client: &Client) -> LeaseLock {
        LeaseLock::new(
            client.clone(),
            &self.namespace,
            LeaseLockParams {
                holder_id: self.holder.clone(),
                lease_name: LEASE_NAME.to_string(),
                lease_ttl: LEASE_TTL,
            },
        )
    }
}

/// Block until the lease is ours.
async fn acquire_leadership(lease: &LeaseLock) {
    info!("Waiting to acquire leadership...");
    loop {
        match lease.try_acquire_or_renew().await {
            Ok(result) if matches!(result, LeaseLockResult::Acquired(_)) => {
                info!("Acquired leadership");
                return;
            }
            Ok(_) => info!("Another replica holds the lease, waiting..."),
            Err(e) => warn!(error = %e, "Failed to acquire lease, retrying..."),
        }
        tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
    }
}

/// Keep renewing the lease; exit the process as soon as it is lost so the
/// pod restarts and rejoins the election.
#[allow(clippy::exit)]
async fn hold_leadership(lease: LeaseLock) {
    loop {
        tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
        match lease.try_acquire_or_renew().await {
            Ok(result) if matches!(result, LeaseLockResult::Acquired(_)) => {}
            Ok(_) => {
                error!("Lost leadership, shutting down");
                std::process::exit(1);
            }
            Err(e) => {
                error!(error = %e, "Failed to renew lease, shutting down");
                std::process::exit(1);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vdisk_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .json()
        .init();

    info!("Starting vdisk-operator");

    let config = OperatorConfig::from_env();
    info!(
        volume_migration = config.volume_migration_enabled,
        watch_namespace = config.watch_namespace.as_deref().unwrap_or("cluster-wide"),
        default_storage_class = config.default_storage_class.as_deref().unwrap_or("none"),
        health_port = config.health_port,
        "Loaded configuration"
    );

    let client = Client::try_default().await?;
    let identity = Identity::from_env();
    info!(
        holder_id = %identity.holder,
        namespace = %identity.namespace,
        lease_name = LEASE_NAME,
        "Connected to Kubernetes cluster"
    );

    // Probes answer before leadership is settled.
    let health = Arc::new(HealthState::new());
    let health_task = tokio::spawn({
        let health = health.clone();
        let port = config.health_port;
        async move {
            if let Err(e) = run_health_server(health, port).await {
                error!(error = %e, "Health server failed");
            }
        }
    });

    acquire_leadership(&identity.lease(&client)).await;
    let renewal_task = tokio::spawn(hold_leadership(identity.lease(&client)));

    let controller_task = tokio::spawn({
        let health = health.clone();
        async move { run_controllers(client, config, Some(health)).await }
    });

    tokio::select! {
        result = controller_task => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
        }
        result = health_task => {
            if let Err(e) = result {
                error!(error = %e, "Health server task panicked");
            }
        }
        Err(e) = renewal_task => {
            error!(error = %e, "Lease renewal task panicked");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            health.set_ready(false).await;
            info!(
                grace_secs = SHUTDOWN_GRACE_PERIOD.as_secs(),
                "Draining in-flight reconciliations"
            );
            tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// Resolves on SIGTERM or Ctrl+C.
///
/// Without signal handlers there is no clean shutdown, so failing to install
/// them is fatal.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
