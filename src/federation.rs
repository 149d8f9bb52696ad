//! Federation and registration.
//!
//! Three outward-facing duties once an instance reaches `running`: verify
//! the web tier actually answers on its resolved address, activate the
//! license registration from inside the registration pod, and push the full
//! set of running, verified instance URLs to the downstream federator.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cluster::ClusterApi;
use crate::deploy::services::{REGISTRATION_COMPONENT, WEBSERVER_SERVICE};
use crate::error::{Error, Result};
use crate::metrics;
use crate::poll::poll_until;
use crate::watch::Store;
use crate::{state, Hub};

const VERIFY_ATTEMPTS: u32 = 60;
const VERIFY_INTERVAL: Duration = Duration::from_secs(10);
const REGISTER_ATTEMPTS: u32 = 20;
const REGISTER_INTERVAL: Duration = Duration::from_secs(10);

/// Post-creation notifications, behind a trait so reconciler tests can plug
/// in a recording fake.
#[async_trait]
pub trait InstanceNotifier: Send + Sync {
    /// Block until the instance answers on its version endpoint.
    async fn verify_instance(&self, namespace: &str, address: &str) -> Result<()>;
    /// Activate registration inside the instance. No-op without a key.
    async fn register(&self, namespace: &str) -> Result<()>;
    /// Push the current set of running, verified instance URLs to the
    /// federator.
    async fn notify(&self) -> Result<()>;
}

/// Live implementation.
pub struct FederationNotifier {
    cluster: Arc<dyn ClusterApi>,
    store: Store<Hub>,
    /// Instances run on self-signed internal certificates, so verification
    /// must skip chain validation.
    insecure_http: reqwest::Client,
    http: reqwest::Client,
    federator_base_url: String,
    registration_key: Option<String>,
    /// Namespaces whose web tier has answered at least once. A running
    /// candidate missing here gets one bounded probe per push before it is
    /// included in the federated set, so a restarted operator re-learns the
    /// verified instances on its first push.
    verified: Mutex<HashSet<String>>,
    /// Serializes pushes so concurrent reconciliations cannot interleave
    /// partial hub sets at the federator.
    push_lock: Mutex<()>,
}

impl std::fmt::Debug for FederationNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederationNotifier")
            .field("federator_base_url", &self.federator_base_url)
            .finish_non_exhaustive()
    }
}

impl FederationNotifier {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        store: Store<Hub>,
        federator_base_url: String,
        registration_key: Option<String>,
    ) -> Result<Self> {
        let insecure_http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(10))
            .build()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            cluster,
            store,
            insecure_http,
            http,
            federator_base_url,
            registration_key,
            verified: Mutex::new(HashSet::new()),
            push_lock: Mutex::new(()),
        })
    }

    /// One bounded probe of the version endpoint over the internal service
    /// address.
    async fn answers(&self, namespace: &str) -> bool {
        let url = format!("{}/api/current-version", instance_url(namespace));
        match self.insecure_http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(namespace, error = %err, "candidate did not answer, excluded from push");
                false
            }
        }
    }
}

/// Internal DNS name other hubs federate against.
fn instance_url(namespace: &str) -> String {
    format!("https://{WEBSERVER_SERVICE}.{namespace}.svc")
}

fn running_namespaces<'a>(hubs: impl Iterator<Item = &'a Hub>) -> Vec<String> {
    let mut namespaces: Vec<String> = hubs
        .filter(|hub| {
            hub.status
                .as_ref()
                .is_some_and(|s| s.state == state::RUNNING)
        })
        .map(|hub| hub.spec.namespace.clone())
        .collect();
    namespaces.sort();
    namespaces
}

/// Federator payload: URLs of the candidates whose web tier is verified.
fn federable_urls(candidates: &[String], verified: &HashSet<String>) -> Vec<String> {
    candidates
        .iter()
        .filter(|ns| verified.contains(ns.as_str()))
        .map(|ns| instance_url(ns))
        .collect()
}

#[async_trait]
impl InstanceNotifier for FederationNotifier {
    async fn verify_instance(&self, namespace: &str, address: &str) -> Result<()> {
        let url = format!("https://{address}:443/api/current-version");
        poll_until("instance version endpoint", VERIFY_INTERVAL, VERIFY_ATTEMPTS, || {
            let request = self.insecure_http.get(&url);
            async move {
                let response = request.send().await?;
                Ok(response.status().is_success())
            }
        })
        .await?;
        self.verified.lock().await.insert(namespace.to_string());
        info!(namespace, address, "instance verified");
        Ok(())
    }

    async fn register(&self, namespace: &str) -> Result<()> {
        let Some(key) = &self.registration_key else {
            debug!(namespace, "no registration key configured, skipping");
            return Ok(());
        };
        let pods = self.cluster.list_pods(namespace).await?;
        let pod = pods
            .iter()
            .find(|pod| {
                pod.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get("component"))
                    .is_some_and(|c| c == REGISTRATION_COMPONENT)
            })
            .and_then(|pod| pod.metadata.name.clone())
            .ok_or_else(|| Error::Internal(format!("no registration pod in {namespace}")))?;

        let url = format!(
            "https://127.0.0.1:8443/registration/HubRegistration?action=activate&registrationid={key}"
        );
        let command = ["curl", "-k", "-sf", "-X", "POST", url.as_str()];
        poll_until("registration activation", REGISTER_INTERVAL, REGISTER_ATTEMPTS, || {
            let cluster = Arc::clone(&self.cluster);
            let namespace = namespace.to_string();
            let pod = pod.clone();
            let command = command;
            async move {
                cluster
                    .pod_exec(&namespace, &pod, REGISTRATION_COMPONENT, &command)
                    .await?;
                Ok(true)
            }
        })
        .await?;
        info!(namespace, "instance registered");
        Ok(())
    }

    async fn notify(&self) -> Result<()> {
        let _guard = self.push_lock.lock().await;
        let candidates = {
            let store = self.store.read().await;
            running_namespaces(store.values())
        };
        // Only verified instances are federated. Unverified candidates get
        // one probe now, so instances that came up before this operator
        // (or answered late) are picked up on the next push.
        for namespace in &candidates {
            if self.verified.lock().await.contains(namespace) {
                continue;
            }
            if self.answers(namespace).await {
                self.verified.lock().await.insert(namespace.clone());
            }
        }
        let urls = federable_urls(&candidates, &*self.verified.lock().await);

        let url = format!("{}/sethubs", self.federator_base_url);
        let response = self
            .http
            .put(&url)
            .json(&json!({ "HubURLs": urls }))
            .send()
            .await?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "federator rejected hub set");
            return Err(Error::Internal(format!(
                "federator returned {}",
                response.status()
            )));
        }
        metrics::increment_federation_pushes();
        metrics::set_instances_running(urls.len() as i64);
        debug!(hubs = urls.len(), "federator updated");
        Ok(())
    }
}
