//! Health and drift monitor.
//!
//! Instances without persistent storage lose their database whenever the
//! postgres pod restarts: the deployment comes back on an empty volume and
//! the application tier wedges against a schema-less database. One monitor
//! task per eligible instance probes on an interval and repairs in place:
//! scale the application tier to zero, re-run schema initialization, scale
//! back up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::cluster::ClusterApi;
use crate::database::{DatabaseAdmin, DbCredentials, DbTarget, ProbeOutcome};
use crate::deploy::bootstrap::{
    ADMIN_PASSWORD_KEY, DB_CREDS_SECRET, POSTGRES_COMPONENT, POSTGRES_PASSWORD_KEY,
    USER_PASSWORD_KEY,
};
use crate::error::{Error, Result};
use crate::metrics;
use crate::watch::Store;
use crate::{state, Hub, HubSpec};

/// Per-instance watchdog tasks, keyed by instance namespace.
pub struct HealthMonitor {
    cluster: Arc<dyn ClusterApi>,
    db: Arc<dyn DatabaseAdmin>,
    hub_store: Store<Hub>,
    interval: Duration,
    /// Stop signal per instance; dropping the sender stops the task.
    channels: Mutex<HashMap<String, watch::Sender<()>>>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor").field("interval", &self.interval).finish_non_exhaustive()
    }
}

impl HealthMonitor {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        db: Arc<dyn DatabaseAdmin>,
        hub_store: Store<Hub>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            db,
            hub_store,
            interval,
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// Whether an instance needs watching at all: an external or persistent
    /// database survives pod restarts on its own.
    pub fn eligible(spec: &HubSpec) -> bool {
        !spec.persistent_storage && spec.external_db.is_none()
    }

    /// Start a watchdog for one instance. Idempotent: a second attach for
    /// the same namespace is a no-op.
    pub async fn attach(self: &Arc<Self>, spec: &HubSpec) {
        if !Self::eligible(spec) {
            return;
        }
        let namespace = spec.namespace.clone();
        let mut channels = self.channels.lock().await;
        if channels.contains_key(&namespace) {
            return;
        }
        let (tx, rx) = watch::channel(());
        channels.insert(namespace.clone(), tx);
        drop(channels);

        let monitor = Arc::clone(self);
        info!(namespace = %namespace, "health monitor attached");
        tokio::spawn(async move {
            monitor.run(namespace, rx).await;
        });
    }

    /// Stop the watchdog for an instance, if one is running.
    pub async fn detach(&self, namespace: &str) {
        if self.channels.lock().await.remove(namespace).is_some() {
            info!(namespace, "health monitor detached");
        }
    }

    /// Re-attach watchdogs after an operator restart, for every instance the
    /// cache already reports as running.
    pub async fn reattach_running(self: &Arc<Self>) {
        let specs: Vec<HubSpec> = {
            let store = self.hub_store.read().await;
            store
                .values()
                .filter(|hub| {
                    hub.status
                        .as_ref()
                        .is_some_and(|s| s.state == state::RUNNING)
                })
                .map(|hub| hub.spec.clone())
                .collect()
        };
        for spec in specs {
            self.attach(&spec).await;
        }
    }

    async fn run(self: Arc<Self>, namespace: String, mut stop: watch::Receiver<()>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        debug!(namespace = %namespace, "monitor stop signal");
                        return;
                    }
                }
            }
            match self.tick(&namespace).await {
                Ok(true) => {}
                Ok(false) => {
                    // Instance is gone; clean up our own channel and exit.
                    self.detach(&namespace).await;
                    return;
                }
                Err(err) => {
                    warn!(namespace = %namespace, error = %err, "health check failed");
                }
            }
        }
    }

    /// One probe cycle. Returns `Ok(false)` when the instance no longer
    /// exists and the watchdog should exit.
    pub async fn tick(&self, namespace: &str) -> Result<bool> {
        if !self.cluster.namespace_exists(namespace).await? {
            return Ok(false);
        }
        let known = {
            let store = self.hub_store.read().await;
            store.values().any(|hub| hub.spec.namespace == namespace)
        };
        if !known {
            return Ok(false);
        }

        let creds = self.load_credentials(namespace).await?;
        let target = DbTarget {
            host: format!("{POSTGRES_COMPONENT}.{namespace}.svc"),
            port: 5432,
            postgres_password: creds.0,
        };
        match self.db.probe(&target).await? {
            ProbeOutcome::Healthy => Ok(true),
            outcome => {
                warn!(namespace, ?outcome, "database drift detected, repairing");
                self.repair(namespace, &target, &creds.1).await?;
                Ok(true)
            }
        }
    }

    /// Scale the application tier away, re-initialize the schema, scale it
    /// back to the replica counts it had.
    async fn repair(
        &self,
        namespace: &str,
        target: &DbTarget,
        creds: &DbCredentials,
    ) -> Result<()> {
        let deployments = self.cluster.list_deployments(namespace).await?;
        let mut prior: Vec<(String, i32)> = Vec::new();
        for deployment in &deployments {
            let name = deployment.metadata.name.clone().unwrap_or_default();
            if name == POSTGRES_COMPONENT {
                continue;
            }
            let replicas = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            prior.push((name, replicas));
        }
        for (name, _) in &prior {
            self.cluster.scale_deployment(namespace, name, 0).await?;
        }

        self.db.init_schema(target, creds).await?;

        for (name, replicas) in &prior {
            self.cluster.scale_deployment(namespace, name, *replicas).await?;
        }
        metrics::increment_monitor_repairs();
        info!(namespace, "database repaired");
        Ok(())
    }

    /// Postgres superuser password plus the role passwords, from the
    /// instance's credentials secret.
    async fn load_credentials(&self, namespace: &str) -> Result<(String, DbCredentials)> {
        let secret = self
            .cluster
            .get_secret(namespace, DB_CREDS_SECRET)
            .await?
            .ok_or_else(|| Error::Internal(format!("secret {DB_CREDS_SECRET} missing in {namespace}")))?;
        let postgres = secret_value(&secret, POSTGRES_PASSWORD_KEY)?;
        let creds = DbCredentials {
            admin_password: secret_value(&secret, ADMIN_PASSWORD_KEY)?,
            user_password: secret_value(&secret, USER_PASSWORD_KEY)?,
        };
        Ok((postgres, creds))
    }
}

fn secret_value(secret: &Secret, key: &str) -> Result<String> {
    if let Some(value) = secret.string_data.as_ref().and_then(|d| d.get(key)) {
        return Ok(value.clone());
    }
    let bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .ok_or_else(|| Error::Internal(format!("secret key {key} missing")))?;
    String::from_utf8(bytes.0.clone())
        .map_err(|_| Error::Internal(format!("secret key {key} is not utf-8")))
}
