//! Operator entrypoint: wires the watch bridges, the work queue, the worker
//! pool, the health monitor and the HTTP server together, then runs until a
//! termination signal drains everything.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::Client;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};

use hub_operator::cluster::KubeCluster;
use hub_operator::config::{Args, OperatorConfig};
use hub_operator::database::PostgresAdmin;
use hub_operator::deploy::Orchestrator;
use hub_operator::federation::FederationNotifier;
use hub_operator::metrics;
use hub_operator::monitor::HealthMonitor;
use hub_operator::queue::WorkQueue;
use hub_operator::reconciler::{KubeHubApi, Reconciler};
use hub_operator::replicator::SecretReplicator;
use hub_operator::server::{self, Readiness};
use hub_operator::watch::{Store, WatchBridge};
use hub_operator::Hub;

#[tokio::main]
async fn main() -> Result<()> {
    // Configure rustls crypto provider FIRST, before any other operations
    // Required for rustls 0.23+ when no default provider is set via features
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hub_operator=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = OperatorConfig::load(args.config.as_deref()).context("loading configuration")?;
    info!(
        namespace = %config.namespace,
        threadiness = config.threadiness,
        "Starting Hub Operator"
    );

    metrics::register_metrics()?;

    let readiness = Readiness::default();
    {
        let readiness = readiness.clone();
        let port = OperatorConfig::metrics_port();
        tokio::spawn(async move {
            if let Err(err) = server::serve(port, readiness).await {
                error!(error = %err, "probe server failed");
            }
        });
    }

    let client = Client::try_default().await.context("creating kubernetes client")?;
    let cluster = Arc::new(KubeCluster::new(client.clone()));
    let db = Arc::new(PostgresAdmin);
    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    // The Hub cache is shared between the bridge that fills it and everyone
    // who reads it (reconciler, monitor, federation).
    let hub_store: Store<Hub> = Arc::new(RwLock::new(HashMap::new()));
    let queue = Arc::new(WorkQueue::new());
    let orchestrator = Arc::new(Orchestrator::new(cluster.clone(), db.clone(), config.clone()));
    let notifier = Arc::new(
        FederationNotifier::new(
            cluster.clone(),
            hub_store.clone(),
            config.federator_base_url.clone(),
            OperatorConfig::registration_key(),
        )
        .context("building federation notifier")?,
    );
    let monitor = HealthMonitor::new(
        cluster.clone(),
        db.clone(),
        hub_store.clone(),
        Duration::from_secs(config.postgres_restart_in_mins * 60),
    );

    let (reconciler, handler) = Reconciler::new(
        hub_store.clone(),
        Arc::clone(&queue),
        Arc::new(KubeHubApi::new(client.clone())),
        orchestrator,
        notifier,
        Arc::clone(&monitor),
        config.hub_defaults.clone(),
    );

    let hubs_api: Api<Hub> = Api::namespaced(client.clone(), &config.namespace);
    let hub_bridge = WatchBridge::with_store(hubs_api, handler, hub_store.clone());
    let mut hub_synced = hub_bridge.sync_complete();

    let replicator = SecretReplicator::new(cluster.clone(), hub_store.clone());
    let secrets_api: Api<Secret> = Api::all(client.clone());
    let secret_bridge = WatchBridge::new(secrets_api, replicator);

    // Watch bridges. A failed initial sync on either bridge is fatal.
    let mut hub_watch = {
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move { hub_bridge.run(rx).await })
    };
    let mut secret_watch = {
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move { secret_bridge.run(rx).await })
    };

    let workers = reconciler.spawn_workers(config.threadiness);

    // Readiness waits on the first complete Hub list. Monitors for
    // instances that were already running resume as soon as the cache can
    // answer for them; if the bridge dies first the select below handles it.
    if hub_synced.wait_for(|synced| *synced).await.is_ok() {
        monitor.reattach_running().await;
        readiness.set_ready(true);
        info!("operator ready");
    }

    // Run until a termination signal or a fatal watch error.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        _ = sigterm.recv() => {
            info!("termination signal received, shutting down");
        }
        result = &mut hub_watch => {
            match result {
                Ok(Err(err)) => error!(error = %err, "hub watch failed"),
                Ok(Ok(())) => warn!("hub watch exited"),
                Err(err) => error!(error = %err, "hub watch task panicked"),
            }
        }
        result = &mut secret_watch => {
            match result {
                Ok(Err(err)) => error!(error = %err, "secret watch failed"),
                Ok(Ok(())) => warn!("secret watch exited"),
                Err(err) => error!(error = %err, "secret watch task panicked"),
            }
        }
    }

    readiness.set_ready(false);
    let _ = shutdown_tx.send(());
    queue.shut_down().await;
    for worker in workers {
        let _ = worker.await;
    }
    hub_watch.abort();
    secret_watch.abort();

    info!("Operator stopped");
    Ok(())
}
