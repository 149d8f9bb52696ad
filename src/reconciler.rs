//! Reconciler.
//!
//! Translates watch events into queue keys and drains the queue with a pool
//! of workers. Each worker resolves a key against the cache: a hit is a
//! live resource to create or update, a miss is a deletion, resolved through
//! the tombstone recorded when the delete event carried the final object.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::HubDefaults;
use crate::deploy::Orchestrator;
use crate::error::Result;
use crate::federation::InstanceNotifier;
use crate::metrics;
use crate::monitor::HealthMonitor;
use crate::queue::WorkQueue;
use crate::watch::{EventHandler, Store};
use crate::{state, Hub, HubSpec, HubStatus};

/// Write access to Hub resources, separated from the reconcile logic so
/// tests can capture state transitions.
#[async_trait]
pub trait HubApi: Send + Sync {
    /// Persist a lifecycle transition: the spec-side mirror and the status
    /// subresource together.
    async fn persist_state(
        &self,
        namespace: &str,
        name: &str,
        spec_state: &str,
        status: &HubStatus,
    ) -> Result<()>;
}

/// Live implementation patching through the API server.
#[derive(Clone)]
pub struct KubeHubApi {
    client: Client,
}

impl KubeHubApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl std::fmt::Debug for KubeHubApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeHubApi").finish_non_exhaustive()
    }
}

#[async_trait]
impl HubApi for KubeHubApi {
    async fn persist_state(
        &self,
        namespace: &str,
        name: &str,
        spec_state: &str,
        status: &HubStatus,
    ) -> Result<()> {
        let api: Api<Hub> = Api::namespaced(self.client.clone(), namespace);
        // Merge patches carry no resourceVersion, so concurrent writers
        // cannot conflict; last state wins, which is what the state machine
        // wants.
        let spec_patch = json!({ "spec": { "state": spec_state } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&spec_patch)).await?;
        let status_patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&status_patch)).await?;
        Ok(())
    }
}

/// Fill unset spec fields from the operator's default profile. Set fields
/// always win; empty strings and `None` count as unset.
pub fn merge_with_defaults(spec: &HubSpec, defaults: &HubDefaults) -> HubSpec {
    let mut merged = spec.clone();
    let fill = |field: &mut String, default: &str| {
        if field.is_empty() {
            *field = default.to_string();
        }
    };
    fill(&mut merged.flavor, &defaults.flavor);
    fill(&mut merged.version, &defaults.version);
    fill(&mut merged.docker_registry, &defaults.docker_registry);
    fill(&mut merged.docker_repo, &defaults.docker_repo);
    let fill_opt = |field: &mut Option<String>, default: &str| {
        if field.as_deref().is_none_or(str::is_empty) {
            *field = Some(default.to_string());
        }
    };
    fill_opt(&mut merged.pvc_claim_size, &defaults.pvc_claim_size);
    fill_opt(&mut merged.backup_interval, &defaults.backup_interval);
    fill_opt(&mut merged.backup_unit, &defaults.backup_unit);
    merged
}

type Tombstones = Arc<Mutex<HashMap<String, Hub>>>;

/// Watch-side half: turns events into queue keys. Deletes additionally
/// record the final object so teardown still knows the target namespace
/// after the cache entry is gone.
pub struct HubEventHandler {
    queue: Arc<WorkQueue>,
    tombstones: Tombstones,
}

impl std::fmt::Debug for HubEventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubEventHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl EventHandler<Hub> for HubEventHandler {
    async fn on_add(&self, obj: &Hub) {
        self.queue.add(&obj.key()).await;
    }

    async fn on_update(&self, _old: &Hub, new: &Hub) {
        self.queue.add(&new.key()).await;
    }

    async fn on_delete(&self, obj: &Hub) {
        let key = obj.key();
        self.tombstones.lock().await.insert(key.clone(), obj.clone());
        self.queue.add(&key).await;
    }
}

/// Queue-side half: the worker pool and the per-key state machine.
pub struct Reconciler {
    store: Store<Hub>,
    queue: Arc<WorkQueue>,
    tombstones: Tombstones,
    hubs: Arc<dyn HubApi>,
    orchestrator: Arc<Orchestrator>,
    notifier: Arc<dyn InstanceNotifier>,
    monitor: Arc<HealthMonitor>,
    defaults: HubDefaults,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store<Hub>,
        queue: Arc<WorkQueue>,
        hubs: Arc<dyn HubApi>,
        orchestrator: Arc<Orchestrator>,
        notifier: Arc<dyn InstanceNotifier>,
        monitor: Arc<HealthMonitor>,
        defaults: HubDefaults,
    ) -> (Arc<Self>, Arc<HubEventHandler>) {
        let tombstones: Tombstones = Arc::new(Mutex::new(HashMap::new()));
        let handler = Arc::new(HubEventHandler {
            queue: Arc::clone(&queue),
            tombstones: Arc::clone(&tombstones),
        });
        let reconciler = Arc::new(Self {
            store,
            queue,
            tombstones,
            hubs,
            orchestrator,
            notifier,
            monitor,
            defaults,
        });
        (reconciler, handler)
    }

    /// Spawn the worker pool. Workers exit when the queue shuts down.
    pub fn spawn_workers(self: &Arc<Self>, threadiness: usize) -> Vec<JoinHandle<()>> {
        (0..threadiness)
            .map(|worker| {
                let reconciler = Arc::clone(self);
                tokio::spawn(async move {
                    info!(worker, "reconcile worker started");
                    while let Some(key) = reconciler.queue.get().await {
                        reconciler.step(&key).await;
                        reconciler.queue.done(&key).await;
                    }
                    info!(worker, "reconcile worker stopped");
                })
            })
            .collect()
    }

    /// One queue item: reconcile and decide between forget and retry.
    pub async fn step(&self, key: &str) {
        let start = std::time::Instant::now();
        let result = self.reconcile(key).await;
        metrics::observe_reconcile_duration(start.elapsed().as_secs_f64());
        match result {
            Ok(()) => {
                metrics::increment_reconciliations("success");
                self.queue.forget(key).await;
            }
            Err(err) if err.is_transient() => {
                metrics::increment_reconciliations("retry");
                warn!(key, error = %err, "reconciliation failed, will retry");
                self.queue.add_rate_limited(key).await;
            }
            Err(err) => {
                metrics::increment_reconciliations("error");
                error!(key, error = %err, "reconciliation failed terminally");
                self.queue.forget(key).await;
            }
        }
    }

    async fn reconcile(&self, key: &str) -> Result<()> {
        let cached = self.store.read().await.get(key).cloned();
        match cached {
            Some(hub) => self.reconcile_live(key, hub).await,
            None => self.reconcile_deleted(key).await,
        }
    }

    async fn reconcile_live(&self, key: &str, hub: Hub) -> Result<()> {
        // Only unprocessed or half-created resources enter the create path.
        // A retried key re-enters at pending/creating, which is safe because
        // every apply is idempotent. Spec updates against a live topology
        // are not propagated.
        let resumable = matches!(
            hub.spec.state.as_str(),
            "" | state::PENDING | state::CREATING
        );
        if !resumable {
            info!(key, state = %hub.spec.state, "resource already processed, ignoring update");
            return Ok(());
        }

        let (namespace, name) = match key.split_once('/') {
            Some(parts) => parts,
            None => {
                warn!(key, "malformed key, dropping");
                return Ok(());
            }
        };

        let merged = merge_with_defaults(&hub.spec, &self.defaults);

        self.hubs
            .persist_state(namespace, name, state::PENDING, &status(state::PENDING))
            .await?;
        self.hubs
            .persist_state(namespace, name, state::CREATING, &status(state::CREATING))
            .await?;

        match self.orchestrator.create_hub(&merged).await {
            Ok(outcome) => {
                let running = HubStatus {
                    state: state::RUNNING.to_string(),
                    address: outcome.address.clone(),
                    pvc_volume_name: outcome.pvc_volume_name,
                    error_message: String::new(),
                };
                self.hubs.persist_state(namespace, name, state::RUNNING, &running).await?;
                info!(key, address = %outcome.address, "instance running");

                if let Err(err) = self
                    .notifier
                    .verify_instance(&merged.namespace, &outcome.address)
                    .await
                {
                    warn!(key, error = %err, "instance did not verify in time");
                }
                if let Err(err) = self.notifier.register(&merged.namespace).await {
                    warn!(key, error = %err, "auto-registration failed");
                }
                if let Err(err) = self.notifier.notify().await {
                    warn!(key, error = %err, "federator notification failed");
                }

                self.monitor.attach(&merged).await;
                Ok(())
            }
            Err(err) if err.is_transient() => Err(err),
            Err(err) => {
                // Terminal: record it on the resource and stop retrying.
                let failed = HubStatus {
                    state: state::ERROR.to_string(),
                    error_message: err.to_string(),
                    ..Default::default()
                };
                self.hubs.persist_state(namespace, name, state::ERROR, &failed).await?;
                error!(key, error = %err, "instance creation failed");
                Ok(())
            }
        }
    }

    async fn reconcile_deleted(&self, key: &str) -> Result<()> {
        let tombstone = self.tombstones.lock().await.get(key).cloned();
        let Some(hub) = tombstone else {
            // Relist noise for a key we never owned.
            return Ok(());
        };
        let namespace = &hub.spec.namespace;
        self.orchestrator.delete_hub(namespace).await?;
        self.monitor.detach(namespace).await;
        if let Err(err) = self.notifier.notify().await {
            warn!(key, error = %err, "federator notification failed after delete");
        }
        self.tombstones.lock().await.remove(key);
        info!(key, "instance torn down");
        Ok(())
    }
}

fn status(state: &str) -> HubStatus {
    HubStatus {
        state: state.to_string(),
        ..Default::default()
    }
}
