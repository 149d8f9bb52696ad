//! Deployment orchestrator.
//!
//! Drives the two-phase creation of an instance: the bootstrap tier first
//! (namespace, credentials, configuration, storage, the embedded database),
//! gated on database readiness, then the dependent tier of stateless
//! services. Every apply is idempotent, so a crashed reconciliation can be
//! replayed from the top. Teardown is the reverse: delete the namespace,
//! wait for it to actually go away, then reap the cluster-scoped leftovers.

pub mod bootstrap;
pub mod services;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::cluster::ClusterApi;
use crate::config::OperatorConfig;
use crate::database::{DatabaseAdmin, DbCredentials, DbTarget};
use crate::error::{Error, Result};
use crate::flavor::flavor_profile;
use crate::poll::{poll_for, poll_until};
use crate::HubSpec;

use bootstrap::{
    clone_job, db_config_map, db_creds_secret, hub_config_map, manual_pv_name,
    postgres_deployment, postgres_pv, postgres_pvc, postgres_service, resolve_credentials,
    Credentials, CLONE_JOB_NAME, POSTGRES_CLAIM, POSTGRES_COMPONENT,
};
use services::{
    dependent_deployments, dependent_services, WEBSERVER_LB_SERVICE, WEBSERVER_NODEPORT_SERVICE,
    WEBSERVER_SERVICE,
};

const ROUTE_ATTEMPTS: u32 = 10;
const LB_ATTEMPTS: u32 = 10;
const NODEPORT_ATTEMPTS: u32 = 6;
const ADDRESS_POLL_INTERVAL: Duration = Duration::from_secs(5);
const CLONE_ATTEMPTS: u32 = 180;
const CLONE_POLL_INTERVAL: Duration = Duration::from_secs(10);
const NAMESPACE_GONE_ATTEMPTS: u32 = 60;
const NAMESPACE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// What creation hands back to the reconciler for the status update.
#[derive(Debug, Clone, Default)]
pub struct CreateOutcome {
    pub address: String,
    pub pvc_volume_name: String,
}

/// Two-phase instance creation and teardown against a [`ClusterApi`].
pub struct Orchestrator {
    cluster: Arc<dyn ClusterApi>,
    db: Arc<dyn DatabaseAdmin>,
    config: OperatorConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        db: Arc<dyn DatabaseAdmin>,
        config: OperatorConfig,
    ) -> Self {
        Self { cluster, db, config }
    }

    fn pod_wait_interval(&self) -> Duration {
        Duration::from_secs(self.config.pod_wait_interval_secs)
    }

    /// Create or repair a full instance. Idempotent end to end.
    pub async fn create_hub(&self, spec: &HubSpec) -> Result<CreateOutcome> {
        let flavor = flavor_profile(&spec.flavor)
            .ok_or_else(|| Error::UnknownFlavor(spec.flavor.clone()))?;
        let creds = resolve_credentials(spec)?;
        let ns = &spec.namespace;
        let claim_size = spec
            .pvc_claim_size
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "20Gi".to_string());

        // Phase 1: the foundation everything else reads from.
        self.cluster.ensure_namespace(ns).await?;
        self.cluster.apply_secret(ns, db_creds_secret(ns, &creds)).await?;
        self.cluster.apply_config_map(ns, hub_config_map(spec)).await?;
        self.cluster.apply_config_map(ns, db_config_map(spec)).await?;

        if spec.external_db.is_none() {
            if spec.persistent_storage {
                if spec.pvc_storage_class.as_deref() == Some("none") {
                    self.cluster.apply_pv(postgres_pv(spec, &claim_size)?).await?;
                }
                self.cluster.apply_pvc(ns, postgres_pvc(spec, &claim_size)).await?;
            }
            self.cluster
                .apply_deployment(ns, postgres_deployment(spec, flavor))
                .await?;
            self.cluster.apply_service(ns, postgres_service(ns)).await?;
            self.wait_for_database_endpoints(ns).await?;
            self.bootstrap_database(spec, &creds).await?;
        }

        // Phase 2: the dependent tier.
        for deployment in dependent_deployments(spec, flavor) {
            self.cluster.apply_deployment(ns, deployment).await?;
        }
        for service in dependent_services(spec, flavor) {
            self.cluster.apply_service(ns, service).await?;
        }

        self.validate_pods_running(ns).await?;

        let pvc_volume_name = if spec.persistent_storage && spec.external_db.is_none() {
            self.resolve_pvc_volume(ns).await?
        } else {
            String::new()
        };
        let address = self.resolve_address(ns).await?;

        info!(namespace = %ns, address = %address, "instance created");
        Ok(CreateOutcome { address, pvc_volume_name })
    }

    /// Tear an instance down completely. The namespace delete removes the
    /// whole tier; the poll guards the cluster-scoped cleanup behind actual
    /// termination so a recreate under the same name starts clean.
    pub async fn delete_hub(&self, namespace: &str) -> Result<()> {
        self.cluster.delete_namespace(namespace).await?;
        let cluster = Arc::clone(&self.cluster);
        poll_until(
            "namespace termination",
            NAMESPACE_POLL_INTERVAL,
            NAMESPACE_GONE_ATTEMPTS,
            || {
                let cluster = Arc::clone(&cluster);
                let namespace = namespace.to_string();
                async move { Ok(!cluster.namespace_exists(&namespace).await?) }
            },
        )
        .await?;
        self.cluster.delete_pv(&manual_pv_name(namespace)).await?;
        self.cluster
            .delete_cluster_role_binding(&format!("hub-{namespace}-admin"))
            .await?;
        info!(namespace, "instance deleted");
        Ok(())
    }

    /// Initialize the fresh database, or clone from a prototype instance
    /// when one is named. The two paths are mutually exclusive.
    async fn bootstrap_database(&self, spec: &HubSpec, creds: &Credentials) -> Result<()> {
        match spec.db_prototype.as_deref().filter(|s| !s.is_empty()) {
            Some(source) => self.clone_database(spec, source).await,
            None => {
                let target = DbTarget {
                    host: format!("{POSTGRES_COMPONENT}.{}.svc", spec.namespace),
                    port: 5432,
                    postgres_password: creds.postgres_password.clone(),
                };
                self.db
                    .init_schema(
                        &target,
                        &DbCredentials {
                            admin_password: creds.admin_password.clone(),
                            user_password: creds.user_password.clone(),
                        },
                    )
                    .await
            }
        }
    }

    async fn clone_database(&self, spec: &HubSpec, source_namespace: &str) -> Result<()> {
        let ns = &spec.namespace;
        info!(namespace = %ns, source = source_namespace, "cloning database from prototype");
        self.cluster.create_job(ns, clone_job(spec, source_namespace)).await?;
        let cluster = Arc::clone(&self.cluster);
        poll_until(
            "database clone job",
            CLONE_POLL_INTERVAL,
            CLONE_ATTEMPTS,
            || {
                let cluster = Arc::clone(&cluster);
                let ns = ns.clone();
                async move {
                    let job = cluster.get_job(&ns, CLONE_JOB_NAME).await?;
                    Ok(job
                        .and_then(|j| j.status)
                        .and_then(|s| s.succeeded)
                        .is_some_and(|n| n > 0))
                }
            },
        )
        .await?;
        self.cluster.delete_job(ns, CLONE_JOB_NAME).await?;
        Ok(())
    }

    /// Wait until the database service reports a ready endpoint. Pod phase
    /// is not enough here: a Running postgres that is still in recovery
    /// would pass a phase check and then fail schema init.
    async fn wait_for_database_endpoints(&self, namespace: &str) -> Result<()> {
        let cluster = Arc::clone(&self.cluster);
        poll_until(
            &format!("{POSTGRES_COMPONENT} endpoints in {namespace}"),
            self.pod_wait_interval(),
            self.config.pod_wait_attempts,
            || {
                let cluster = Arc::clone(&cluster);
                let namespace = namespace.to_string();
                async move {
                    cluster
                        .service_has_ready_endpoints(&namespace, POSTGRES_COMPONENT)
                        .await
                }
            },
        )
        .await
    }

    /// Post-apply validation: every pod in the namespace must settle into
    /// Running (or Succeeded, for finished jobs) within the bounded wait.
    async fn validate_pods_running(&self, namespace: &str) -> Result<()> {
        let mut offender: Option<(String, String)> = None;
        for attempt in 1..=self.config.pod_wait_attempts {
            let pods = self.cluster.list_pods(namespace).await?;
            offender = pods.iter().find_map(|pod| {
                let phase = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.clone())
                    .unwrap_or_else(|| "Unknown".to_string());
                if phase == "Running" || phase == "Succeeded" {
                    None
                } else {
                    let name = pod.metadata.name.clone().unwrap_or_default();
                    Some((name, phase))
                }
            });
            match &offender {
                None => return Ok(()),
                Some((pod, phase)) => {
                    warn!(namespace, pod = %pod, phase = %phase, attempt, "pod not running yet");
                }
            }
            if attempt < self.config.pod_wait_attempts {
                tokio::time::sleep(self.pod_wait_interval()).await;
            }
        }
        let (pod, phase) = offender.unwrap_or_default();
        Err(Error::PodNotRunning { pod, phase })
    }

    async fn resolve_pvc_volume(&self, namespace: &str) -> Result<String> {
        let pvc = self.cluster.get_pvc(namespace, POSTGRES_CLAIM).await?;
        Ok(pvc
            .and_then(|p| p.spec)
            .and_then(|s| s.volume_name)
            .unwrap_or_default())
    }

    /// Externally reachable address, in preference order: OpenShift route
    /// host, load-balancer ingress, node-port service cluster IP. Each stage
    /// polls within its own bound before falling through.
    async fn resolve_address(&self, namespace: &str) -> Result<String> {
        if self.config.openshift_routes {
            let cluster = Arc::clone(&self.cluster);
            let route = poll_for(
                "route host",
                ADDRESS_POLL_INTERVAL,
                ROUTE_ATTEMPTS,
                || {
                    let cluster = Arc::clone(&cluster);
                    let namespace = namespace.to_string();
                    async move { cluster.route_host(&namespace, WEBSERVER_SERVICE).await }
                },
            )
            .await;
            match route {
                Ok(host) => return Ok(host),
                Err(err) => warn!(namespace, error = %err, "no route, trying load balancer"),
            }
        }

        let cluster = Arc::clone(&self.cluster);
        let lb = poll_for(
            "load balancer ingress",
            ADDRESS_POLL_INTERVAL,
            LB_ATTEMPTS,
            || {
                let cluster = Arc::clone(&cluster);
                let namespace = namespace.to_string();
                async move {
                    let service = cluster.get_service(&namespace, WEBSERVER_LB_SERVICE).await?;
                    Ok(service
                        .and_then(|s| s.status)
                        .and_then(|s| s.load_balancer)
                        .and_then(|lb| lb.ingress)
                        .and_then(|ingress| {
                            ingress.into_iter().find_map(|i| i.ip.or(i.hostname))
                        }))
                }
            },
        )
        .await;
        match lb {
            Ok(address) => return Ok(address),
            Err(err) => warn!(namespace, error = %err, "no load balancer, trying node port"),
        }

        let cluster = Arc::clone(&self.cluster);
        poll_for(
            "node port cluster ip",
            ADDRESS_POLL_INTERVAL,
            NODEPORT_ATTEMPTS,
            || {
                let cluster = Arc::clone(&cluster);
                let namespace = namespace.to_string();
                async move {
                    let service = cluster
                        .get_service(&namespace, WEBSERVER_NODEPORT_SERVICE)
                        .await?;
                    Ok(service
                        .and_then(|s| s.spec)
                        .and_then(|s| s.cluster_ip)
                        .filter(|ip| !ip.is_empty() && ip != "None"))
                }
            },
        )
        .await
    }
}
