//! Secret replication.
//!
//! Shared certificate material lives in one source secret and is fanned out
//! into dependent instance namespaces. Two kinds of edges feed the
//! fan-out: every Hub whose `certificateName` points at a source
//! namespace depends on that namespace's `hub-certificate` secret, and any
//! secret can opt in explicitly through the `replicate-from` annotation.
//! Replicas are stamped with the source version so an unchanged source is a
//! no-op; deleting a source revokes the data out of its replicas without
//! deleting them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cluster::ClusterApi;
use crate::error::Result;
use crate::watch::{object_key, EventHandler, Store};
use crate::Hub;

/// Certificate source secrets carry this fixed name in their namespace.
pub const SOURCE_SECRET_NAME: &str = "hub-certificate";
/// Explicit opt-in: `namespace/name` of the source to mirror.
pub const REPLICATE_FROM_ANNOTATION: &str = "hubops.io/replicate-from";
pub const REPLICATED_AT_ANNOTATION: &str = "hubops.io/replicated-at";
pub const REPLICATED_FROM_VERSION_ANNOTATION: &str = "hubops.io/replicated-from-version";

/// The spec value that opts an instance out of certificate replication.
const CUSTOM_CERTIFICATE: &str = "Custom";

type Dependents = Mutex<HashMap<String, HashSet<String>>>;

pub struct SecretReplicator {
    cluster: Arc<dyn ClusterApi>,
    hub_store: Store<Hub>,
    /// source key -> annotation-declared dependent secret keys. Certificate
    /// edges are recomputed from the hub cache on every pass, so a deleted
    /// instance falls out of the fan-out on its own.
    dependents: Dependents,
}

impl std::fmt::Debug for SecretReplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretReplicator").finish_non_exhaustive()
    }
}

impl SecretReplicator {
    pub fn new(cluster: Arc<dyn ClusterApi>, hub_store: Store<Hub>) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            hub_store,
            dependents: Mutex::new(HashMap::new()),
        })
    }

    fn is_source(secret: &Secret) -> bool {
        secret.metadata.name.as_deref() == Some(SOURCE_SECRET_NAME)
    }

    fn replicate_from(secret: &Secret) -> Option<String> {
        secret
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(REPLICATE_FROM_ANNOTATION))
            .cloned()
    }

    /// Namespaces of hubs whose certificate selector points at this source
    /// namespace. "Custom" never matches.
    async fn certificate_dependents(&self, source_namespace: &str) -> Vec<String> {
        let store = self.hub_store.read().await;
        store
            .values()
            .filter(|hub| {
                hub.spec
                    .certificate_name
                    .as_deref()
                    .is_some_and(|c| c == source_namespace && c != CUSTOM_CERTIFICATE)
            })
            .map(|hub| hub.spec.namespace.clone())
            .collect()
    }

    async fn sync_source(&self, source: &Secret) -> Result<()> {
        let source_key = object_key(source);
        let source_namespace = source.metadata.namespace.clone().unwrap_or_default();

        let mut targets: HashSet<String> = self
            .certificate_dependents(&source_namespace)
            .await
            .into_iter()
            .map(|ns| format!("{ns}/{SOURCE_SECRET_NAME}"))
            .collect();
        if let Some(annotated) = self.dependents.lock().await.get(&source_key) {
            targets.extend(annotated.iter().cloned());
        }

        for target in targets {
            let Some((ns, name)) = target.split_once('/') else { continue };
            if ns == source_namespace && name == source.name_any() {
                continue;
            }
            if let Err(err) = self.replicate(source, ns, name).await {
                warn!(source = %source_key, target = %target, error = %err, "replication failed");
            }
        }
        Ok(())
    }

    /// Mirror the source's data into one target secret, unless the target
    /// already carries this source version.
    async fn replicate(&self, source: &Secret, target_ns: &str, target_name: &str) -> Result<()> {
        let source_version = source.metadata.resource_version.clone().unwrap_or_default();
        let existing = self.cluster.get_secret(target_ns, target_name).await?;
        if let Some(existing) = &existing {
            if !needs_replication(&source_version, existing) {
                debug!(target_ns, target_name, "replica up to date");
                return Ok(());
            }
        }

        let replica = build_replica(source, target_ns, target_name, &source_version);
        self.cluster.apply_secret(target_ns, replica).await?;
        crate::metrics::increment_secret_replications();
        info!(
            source = %object_key(source),
            target = format!("{target_ns}/{target_name}"),
            version = %source_version,
            "secret replicated"
        );
        Ok(())
    }

    /// Register an explicitly annotated dependent and bring it up to date.
    async fn sync_dependent(&self, dependent: &Secret, source_key: &str) -> Result<()> {
        let dependent_key = object_key(dependent);
        if source_key == dependent_key {
            return Ok(());
        }
        self.dependents
            .lock()
            .await
            .entry(source_key.to_string())
            .or_default()
            .insert(dependent_key.clone());

        let Some((source_ns, source_name)) = source_key.split_once('/') else {
            warn!(source = source_key, "malformed replicate-from annotation");
            return Ok(());
        };
        let Some(source) = self.cluster.get_secret(source_ns, source_name).await? else {
            debug!(source = source_key, dependent = %dependent_key, "source not present yet");
            return Ok(());
        };
        let Some((target_ns, target_name)) = dependent_key.split_once('/') else {
            return Ok(());
        };
        self.replicate(&source, target_ns, target_name).await
    }

    /// Source is gone: revoke the data from every replica, keep the objects.
    async fn revoke_dependents(&self, source: &Secret) -> Result<()> {
        let source_key = object_key(source);
        let source_namespace = source.metadata.namespace.clone().unwrap_or_default();
        let mut targets = self
            .dependents
            .lock()
            .await
            .remove(&source_key)
            .unwrap_or_default();
        targets.extend(
            self.certificate_dependents(&source_namespace)
                .await
                .into_iter()
                .map(|ns| format!("{ns}/{SOURCE_SECRET_NAME}")),
        );
        for target in targets {
            let Some((ns, name)) = target.split_once('/') else { continue };
            if ns == source_namespace && name == source.name_any() {
                continue;
            }
            if let Err(err) = self.cluster.clear_secret_data(ns, name).await {
                warn!(source = %source_key, target = %target, error = %err, "revocation failed");
            } else {
                info!(source = %source_key, target = %target, "replica data revoked");
            }
        }
        Ok(())
    }

    async fn forget_dependent(&self, dependent: &Secret, source_key: &str) {
        let dependent_key = object_key(dependent);
        let mut map = self.dependents.lock().await;
        if let Some(set) = map.get_mut(source_key) {
            set.remove(&dependent_key);
            if set.is_empty() {
                map.remove(source_key);
            }
        }
    }

    async fn handle_upsert(&self, secret: &Secret) {
        if Self::is_source(secret) {
            if let Err(err) = self.sync_source(secret).await {
                warn!(secret = %object_key(secret), error = %err, "source sync failed");
            }
        }
        if let Some(source_key) = Self::replicate_from(secret) {
            if let Err(err) = self.sync_dependent(secret, &source_key).await {
                warn!(secret = %object_key(secret), error = %err, "dependent sync failed");
            }
        }
    }
}

/// A replica is stale when its recorded source version differs.
pub fn needs_replication(source_version: &str, target: &Secret) -> bool {
    target
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(REPLICATED_FROM_VERSION_ANNOTATION))
        .map(|v| v != source_version)
        .unwrap_or(true)
}

fn build_replica(source: &Secret, target_ns: &str, target_name: &str, version: &str) -> Secret {
    let annotations = std::collections::BTreeMap::from([
        (REPLICATE_FROM_ANNOTATION.to_string(), object_key(source)),
        (REPLICATED_AT_ANNOTATION.to_string(), Utc::now().to_rfc3339()),
        (REPLICATED_FROM_VERSION_ANNOTATION.to_string(), version.to_string()),
    ]);
    Secret {
        metadata: ObjectMeta {
            name: Some(target_name.to_string()),
            namespace: Some(target_ns.to_string()),
            annotations: Some(annotations),
            ..Default::default()
        },
        data: source.data.clone(),
        string_data: source.string_data.clone(),
        type_: source.type_.clone(),
        ..Default::default()
    }
}

#[async_trait]
impl EventHandler<Secret> for SecretReplicator {
    async fn on_add(&self, obj: &Secret) {
        self.handle_upsert(obj).await;
    }

    async fn on_update(&self, _old: &Secret, new: &Secret) {
        self.handle_upsert(new).await;
    }

    async fn on_delete(&self, obj: &Secret) {
        if Self::is_source(obj) {
            if let Err(err) = self.revoke_dependents(obj).await {
                warn!(secret = %object_key(obj), error = %err, "revocation failed");
            }
        }
        if let Some(source_key) = Self::replicate_from(obj) {
            self.forget_dependent(obj, &source_key).await;
        }
    }
}
