//! End-to-end tests for the orchestrator, the reconciler state machine and
//! the secret replicator, driven by an in-memory cluster that records every
//! operation.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolume, PersistentVolumeClaim, Pod, PodStatus, Secret, Service,
    ServiceStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::RwLock;

use hub_operator::cluster::ClusterApi;
use hub_operator::config::OperatorConfig;
use hub_operator::database::{DatabaseAdmin, DbCredentials, DbTarget, ProbeOutcome};
use hub_operator::deploy::Orchestrator;
use hub_operator::federation::InstanceNotifier;
use hub_operator::monitor::HealthMonitor;
use hub_operator::queue::WorkQueue;
use hub_operator::reconciler::{HubApi, Reconciler};
use hub_operator::replicator::SecretReplicator;
use hub_operator::watch::{EventHandler, Store};
use hub_operator::{state, Error, Hub, HubSpec, HubStatus, Result};

type CallLog = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
struct FakeState {
    namespaces: HashSet<String>,
    secrets: HashMap<(String, String), Secret>,
    config_maps: HashMap<(String, String), ConfigMap>,
    pvcs: HashMap<(String, String), PersistentVolumeClaim>,
    pvs: HashMap<String, PersistentVolume>,
    deployments: HashMap<(String, String), Deployment>,
    services: HashMap<(String, String), Service>,
    jobs: HashMap<(String, String), Job>,
}

/// In-memory cluster. Applies are upserts; pods are synthesized from the
/// deployments so readiness gates pass; the LB service reports an ingress IP.
struct FakeCluster {
    state: Mutex<FakeState>,
    calls: CallLog,
    /// Endpoint checks answer "not ready" this many times before going
    /// green, to exercise the database readiness gate.
    endpoints_not_ready: Mutex<u32>,
}

impl FakeCluster {
    fn new(calls: CallLog) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            calls,
            endpoints_not_ready: Mutex::new(0),
        })
    }

    fn delay_endpoints(&self, polls: u32) {
        *self.endpoints_not_ready.lock().unwrap() = polls;
    }

    fn log(&self, entry: String) {
        self.calls.lock().unwrap().push(entry);
    }

    fn deployment_names(&self, ns: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .deployments
            .keys()
            .filter(|(n, _)| n == ns)
            .map(|(_, name)| name.clone())
            .collect()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().namespaces.contains(name))
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        self.log(format!("ensure_namespace {name}"));
        self.state.lock().unwrap().namespaces.insert(name.to_string());
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        self.log(format!("delete_namespace {name}"));
        let mut state = self.state.lock().unwrap();
        state.namespaces.remove(name);
        state.secrets.retain(|(ns, _), _| ns != name);
        state.deployments.retain(|(ns, _), _| ns != name);
        state.services.retain(|(ns, _), _| ns != name);
        Ok(())
    }

    async fn apply_secret(&self, ns: &str, secret: Secret) -> Result<()> {
        self.log(format!("apply_secret {ns}/{}", secret.name_any()));
        self.state
            .lock()
            .unwrap()
            .secrets
            .insert((ns.to_string(), secret.name_any()), secret);
        Ok(())
    }

    async fn get_secret(&self, ns: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .secrets
            .get(&(ns.to_string(), name.to_string()))
            .cloned())
    }

    async fn clear_secret_data(&self, ns: &str, name: &str) -> Result<()> {
        self.log(format!("clear_secret_data {ns}/{name}"));
        if let Some(secret) = self
            .state
            .lock()
            .unwrap()
            .secrets
            .get_mut(&(ns.to_string(), name.to_string()))
        {
            secret.data = None;
            secret.string_data = None;
        }
        Ok(())
    }

    async fn apply_config_map(&self, ns: &str, cm: ConfigMap) -> Result<()> {
        self.log(format!("apply_config_map {ns}/{}", cm.name_any()));
        self.state
            .lock()
            .unwrap()
            .config_maps
            .insert((ns.to_string(), cm.name_any()), cm);
        Ok(())
    }

    async fn apply_pvc(&self, ns: &str, mut pvc: PersistentVolumeClaim) -> Result<()> {
        let pvc_name = pvc.name_any();
        self.log(format!("apply_pvc {ns}/{pvc_name}"));
        // Binding happens out of band; simulate an immediately bound volume.
        if let Some(spec) = pvc.spec.as_mut() {
            if spec.volume_name.is_none() {
                spec.volume_name = Some(format!("pv-{pvc_name}"));
            }
        }
        self.state
            .lock()
            .unwrap()
            .pvcs
            .insert((ns.to_string(), pvc.name_any()), pvc);
        Ok(())
    }

    async fn get_pvc(&self, ns: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pvcs
            .get(&(ns.to_string(), name.to_string()))
            .cloned())
    }

    async fn apply_pv(&self, pv: PersistentVolume) -> Result<()> {
        self.log(format!("apply_pv {}", pv.name_any()));
        self.state.lock().unwrap().pvs.insert(pv.name_any(), pv);
        Ok(())
    }

    async fn delete_pv(&self, name: &str) -> Result<()> {
        self.log(format!("delete_pv {name}"));
        self.state.lock().unwrap().pvs.remove(name);
        Ok(())
    }

    async fn apply_deployment(&self, ns: &str, deployment: Deployment) -> Result<()> {
        self.log(format!("apply_deployment {ns}/{}", deployment.name_any()));
        self.state
            .lock()
            .unwrap()
            .deployments
            .insert((ns.to_string(), deployment.name_any()), deployment);
        Ok(())
    }

    async fn list_deployments(&self, ns: &str) -> Result<Vec<Deployment>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .deployments
            .iter()
            .filter(|((n, _), _)| n == ns)
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn scale_deployment(&self, ns: &str, name: &str, replicas: i32) -> Result<()> {
        self.log(format!("scale_deployment {ns}/{name} {replicas}"));
        if let Some(deployment) = self
            .state
            .lock()
            .unwrap()
            .deployments
            .get_mut(&(ns.to_string(), name.to_string()))
        {
            if let Some(spec) = deployment.spec.as_mut() {
                spec.replicas = Some(replicas);
            }
        }
        Ok(())
    }

    async fn apply_service(&self, ns: &str, mut service: Service) -> Result<()> {
        self.log(format!("apply_service {ns}/{}", service.name_any()));
        // Cluster-side status: the LB gets an ingress IP, everything else a
        // cluster IP.
        let name = service.name_any();
        if name == "webserver-lb" {
            service.status = Some(ServiceStatus {
                load_balancer: Some(k8s_openapi::api::core::v1::LoadBalancerStatus {
                    ingress: Some(vec![k8s_openapi::api::core::v1::LoadBalancerIngress {
                        ip: Some("10.0.0.5".to_string()),
                        ..Default::default()
                    }]),
                }),
                ..Default::default()
            });
        } else if let Some(spec) = service.spec.as_mut() {
            spec.cluster_ip = Some("10.96.0.17".to_string());
        }
        self.state
            .lock()
            .unwrap()
            .services
            .insert((ns.to_string(), name), service);
        Ok(())
    }

    async fn get_service(&self, ns: &str, name: &str) -> Result<Option<Service>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .services
            .get(&(ns.to_string(), name.to_string()))
            .cloned())
    }

    async fn service_has_ready_endpoints(&self, ns: &str, name: &str) -> Result<bool> {
        self.log(format!("endpoints {ns}/{name}"));
        {
            let mut remaining = self.endpoints_not_ready.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(false);
            }
        }
        Ok(self
            .state
            .lock()
            .unwrap()
            .deployments
            .contains_key(&(ns.to_string(), name.to_string())))
    }

    async fn list_pods(&self, ns: &str) -> Result<Vec<Pod>> {
        // One running pod per deployment.
        Ok(self
            .deployment_names(ns)
            .into_iter()
            .map(|name| Pod {
                metadata: ObjectMeta {
                    name: Some(format!("{name}-0")),
                    namespace: Some(ns.to_string()),
                    labels: Some(std::collections::BTreeMap::from([(
                        "component".to_string(),
                        name,
                    )])),
                    ..Default::default()
                },
                status: Some(PodStatus {
                    phase: Some("Running".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect())
    }

    async fn pod_exec(
        &self,
        ns: &str,
        pod: &str,
        _container: &str,
        _command: &[&str],
    ) -> Result<String> {
        self.log(format!("pod_exec {ns}/{pod}"));
        Ok(String::new())
    }

    async fn create_job(&self, ns: &str, mut job: Job) -> Result<()> {
        self.log(format!("create_job {ns}/{}", job.name_any()));
        job.status = Some(JobStatus {
            succeeded: Some(1),
            ..Default::default()
        });
        self.state
            .lock()
            .unwrap()
            .jobs
            .insert((ns.to_string(), job.name_any()), job);
        Ok(())
    }

    async fn get_job(&self, ns: &str, name: &str) -> Result<Option<Job>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .jobs
            .get(&(ns.to_string(), name.to_string()))
            .cloned())
    }

    async fn delete_job(&self, ns: &str, name: &str) -> Result<()> {
        self.log(format!("delete_job {ns}/{name}"));
        self.state
            .lock()
            .unwrap()
            .jobs
            .remove(&(ns.to_string(), name.to_string()));
        Ok(())
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()> {
        self.log(format!("delete_cluster_role_binding {name}"));
        Ok(())
    }

    async fn route_host(&self, _ns: &str, _name: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Scripted database: probe outcomes are consumed in order, then Healthy.
struct FakeDatabase {
    calls: CallLog,
    probe_script: Mutex<VecDeque<ProbeOutcome>>,
}

impl FakeDatabase {
    fn new(calls: CallLog, script: Vec<ProbeOutcome>) -> Arc<Self> {
        Arc::new(Self {
            calls,
            probe_script: Mutex::new(script.into()),
        })
    }
}

#[async_trait]
impl DatabaseAdmin for FakeDatabase {
    async fn probe(&self, target: &DbTarget) -> Result<ProbeOutcome> {
        self.calls.lock().unwrap().push(format!("probe {}", target.host));
        Ok(self
            .probe_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ProbeOutcome::Healthy))
    }

    async fn init_schema(&self, target: &DbTarget, _creds: &DbCredentials) -> Result<()> {
        self.calls.lock().unwrap().push(format!("init_schema {}", target.host));
        Ok(())
    }
}

#[derive(Default)]
struct FakeNotifier {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl InstanceNotifier for FakeNotifier {
    async fn verify_instance(&self, _namespace: &str, address: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("verify {address}"));
        Ok(())
    }

    async fn register(&self, namespace: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("register {namespace}"));
        Ok(())
    }

    async fn notify(&self) -> Result<()> {
        self.calls.lock().unwrap().push("notify".to_string());
        Ok(())
    }
}

/// Records lifecycle transitions instead of patching the API server.
#[derive(Default)]
struct FakeHubApi {
    transitions: Mutex<Vec<(String, HubStatus)>>,
}

#[async_trait]
impl HubApi for FakeHubApi {
    async fn persist_state(
        &self,
        _namespace: &str,
        _name: &str,
        spec_state: &str,
        status: &HubStatus,
    ) -> Result<()> {
        self.transitions
            .lock()
            .unwrap()
            .push((spec_state.to_string(), status.clone()));
        Ok(())
    }
}

fn hub_spec(namespace: &str) -> HubSpec {
    HubSpec {
        namespace: namespace.to_string(),
        flavor: "small".to_string(),
        version: "5.0.2".to_string(),
        docker_registry: "docker.io".to_string(),
        docker_repo: "hubapp".to_string(),
        admin_password: Some("a".to_string()),
        user_password: Some("u".to_string()),
        postgres_password: Some("p".to_string()),
        ..Default::default()
    }
}

fn hub(namespace: &str) -> Hub {
    Hub {
        metadata: ObjectMeta {
            name: Some(namespace.to_string()),
            namespace: Some("hub-system".to_string()),
            ..Default::default()
        },
        spec: hub_spec(namespace),
        status: None,
    }
}

fn orchestrator(
    cluster: Arc<FakeCluster>,
    db: Arc<FakeDatabase>,
) -> Orchestrator {
    Orchestrator::new(cluster, db, OperatorConfig::default())
}

fn first_index(calls: &[String], prefix: &str) -> Option<usize> {
    calls.iter().position(|c| c.starts_with(prefix))
}

#[tokio::test(start_paused = true)]
async fn create_applies_bootstrap_before_dependents() {
    let calls: CallLog = Arc::default();
    let cluster = FakeCluster::new(calls.clone());
    let db = FakeDatabase::new(calls.clone(), vec![]);
    let orch = orchestrator(cluster, db);

    orch.create_hub(&hub_spec("t1")).await.expect("create should succeed");

    let calls = calls.lock().unwrap();
    let postgres = first_index(&calls, "apply_deployment t1/postgres").unwrap();
    let init = first_index(&calls, "init_schema").unwrap();
    let webserver = first_index(&calls, "apply_deployment t1/webserver").unwrap();
    let namespace = first_index(&calls, "ensure_namespace t1").unwrap();
    assert!(namespace < postgres, "namespace before database");
    assert!(postgres < init, "database deployed before schema init");
    assert!(init < webserver, "bootstrap tier gated before dependents");
}

#[tokio::test(start_paused = true)]
async fn create_is_idempotent() {
    let calls: CallLog = Arc::default();
    let cluster = FakeCluster::new(calls.clone());
    let db = FakeDatabase::new(calls.clone(), vec![]);
    let orch = orchestrator(cluster.clone(), db);

    let first = orch.create_hub(&hub_spec("t1")).await.expect("first create");
    let deployments_after_first = cluster.deployment_names("t1").len();
    let second = orch.create_hub(&hub_spec("t1")).await.expect("second create");

    assert_eq!(first.address, second.address);
    assert_eq!(cluster.deployment_names("t1").len(), deployments_after_first);
}

#[tokio::test(start_paused = true)]
async fn create_resolves_lb_address_and_pvc_volume() {
    let calls: CallLog = Arc::default();
    let cluster = FakeCluster::new(calls.clone());
    let db = FakeDatabase::new(calls.clone(), vec![]);
    let orch = orchestrator(cluster, db);

    let mut spec = hub_spec("t1");
    spec.persistent_storage = true;
    spec.pvc_claim_size = Some("20Gi".to_string());
    let outcome = orch.create_hub(&spec).await.expect("create");

    assert_eq!(outcome.address, "10.0.0.5");
    assert_eq!(outcome.pvc_volume_name, "pv-hub-postgres-claim");
}

#[tokio::test(start_paused = true)]
async fn external_db_skips_embedded_database() {
    let calls: CallLog = Arc::default();
    let cluster = FakeCluster::new(calls.clone());
    let db = FakeDatabase::new(calls.clone(), vec![]);
    let orch = orchestrator(cluster, db);

    let mut spec = hub_spec("t1");
    spec.external_db = Some(hub_operator::ExternalDbConfig {
        host: "db.corp".to_string(),
        port: 5432,
        admin_user: "root".to_string(),
        user: "app".to_string(),
    });
    orch.create_hub(&spec).await.expect("create");

    let calls = calls.lock().unwrap();
    assert!(first_index(&calls, "apply_deployment t1/postgres").is_none());
    assert!(first_index(&calls, "init_schema").is_none());
    assert!(first_index(&calls, "apply_deployment t1/webserver").is_some());
}

#[tokio::test(start_paused = true)]
async fn prototype_clone_replaces_schema_init() {
    let calls: CallLog = Arc::default();
    let cluster = FakeCluster::new(calls.clone());
    let db = FakeDatabase::new(calls.clone(), vec![]);
    let orch = orchestrator(cluster, db);

    let mut spec = hub_spec("t2");
    spec.db_prototype = Some("t1".to_string());
    orch.create_hub(&spec).await.expect("create");

    let calls = calls.lock().unwrap();
    assert!(first_index(&calls, "init_schema").is_none());
    let create = first_index(&calls, "create_job t2/hub-db-clone").unwrap();
    let delete = first_index(&calls, "delete_job t2/hub-db-clone").unwrap();
    assert!(create < delete);
}

#[tokio::test(start_paused = true)]
async fn unknown_flavor_fails_before_touching_the_cluster() {
    let calls: CallLog = Arc::default();
    let cluster = FakeCluster::new(calls.clone());
    let db = FakeDatabase::new(calls.clone(), vec![]);
    let orch = orchestrator(cluster, db);

    let mut spec = hub_spec("t1");
    spec.flavor = "tiny".to_string();
    let err = orch.create_hub(&spec).await.unwrap_err();
    assert!(matches!(err, Error::UnknownFlavor(_)));
    assert!(calls.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn delete_reaps_cluster_scoped_leftovers_after_namespace_is_gone() {
    let calls: CallLog = Arc::default();
    let cluster = FakeCluster::new(calls.clone());
    let db = FakeDatabase::new(calls.clone(), vec![]);
    let orch = orchestrator(cluster.clone(), db);

    orch.create_hub(&hub_spec("t1")).await.expect("create");
    orch.delete_hub("t1").await.expect("delete");

    assert!(!cluster.namespace_exists("t1").await.unwrap());
    let calls = calls.lock().unwrap();
    let ns = first_index(&calls, "delete_namespace t1").unwrap();
    let pv = first_index(&calls, "delete_pv t1-postgres-pv").unwrap();
    let crb = first_index(&calls, "delete_cluster_role_binding hub-t1-admin").unwrap();
    assert!(ns < pv);
    assert!(ns < crb);
}

fn wire_reconciler(
    cluster: Arc<FakeCluster>,
    db: Arc<FakeDatabase>,
) -> (
    Arc<Reconciler>,
    Arc<hub_operator::reconciler::HubEventHandler>,
    Store<Hub>,
    Arc<FakeHubApi>,
    Arc<FakeNotifier>,
    Arc<WorkQueue>,
) {
    let store: Store<Hub> = Arc::new(RwLock::new(HashMap::new()));
    let queue = Arc::new(WorkQueue::new());
    let hub_api = Arc::new(FakeHubApi::default());
    let notifier = Arc::new(FakeNotifier::default());
    let monitor = HealthMonitor::new(
        cluster.clone(),
        db.clone(),
        store.clone(),
        Duration::from_secs(180),
    );
    let orch = Arc::new(Orchestrator::new(cluster, db, OperatorConfig::default()));
    let (reconciler, handler) = Reconciler::new(
        store.clone(),
        queue.clone(),
        hub_api.clone(),
        orch,
        notifier.clone(),
        monitor,
        hub_operator::config::HubDefaults::default(),
    );
    (reconciler, handler, store, hub_api, notifier, queue)
}

#[tokio::test(start_paused = true)]
async fn fresh_resource_walks_pending_creating_running() {
    let calls: CallLog = Arc::default();
    let cluster = FakeCluster::new(calls.clone());
    let db = FakeDatabase::new(calls.clone(), vec![]);
    let (reconciler, _handler, store, hub_api, notifier, _queue) = wire_reconciler(cluster, db);

    let hub = hub("t1");
    store.write().await.insert(hub.key(), hub.clone());
    reconciler.step(&hub.key()).await;

    let transitions = hub_api.transitions.lock().unwrap();
    let states: Vec<&str> = transitions.iter().map(|(s, _)| s.as_str()).collect();
    assert_eq!(states, vec![state::PENDING, state::CREATING, state::RUNNING]);

    let (_, running) = transitions.last().unwrap();
    assert_eq!(running.address, "10.0.0.5");
    // No persistent storage requested, so no claim to report.
    assert!(running.pvc_volume_name.is_empty());
    assert!(running.error_message.is_empty());

    let notified = notifier.calls.lock().unwrap();
    assert_eq!(
        *notified,
        vec![
            "verify 10.0.0.5".to_string(),
            "register t1".to_string(),
            "notify".to_string()
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn already_processed_resource_is_left_alone() {
    let calls: CallLog = Arc::default();
    let cluster = FakeCluster::new(calls.clone());
    let db = FakeDatabase::new(calls.clone(), vec![]);
    let (reconciler, _handler, store, hub_api, _notifier, _queue) = wire_reconciler(cluster, db);

    let mut hub = hub("t1");
    hub.spec.state = state::RUNNING.to_string();
    store.write().await.insert(hub.key(), hub.clone());
    reconciler.step(&hub.key()).await;

    assert!(hub_api.transitions.lock().unwrap().is_empty());
    assert!(calls.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn terminal_error_lands_in_error_state_with_message() {
    let calls: CallLog = Arc::default();
    let cluster = FakeCluster::new(calls.clone());
    let db = FakeDatabase::new(calls.clone(), vec![]);
    let (reconciler, _handler, store, hub_api, _notifier, _queue) = wire_reconciler(cluster, db);

    let mut hub = hub("t1");
    hub.spec.flavor = "enormous".to_string();
    store.write().await.insert(hub.key(), hub.clone());
    reconciler.step(&hub.key()).await;

    let transitions = hub_api.transitions.lock().unwrap();
    let (last_state, last_status) = transitions.last().unwrap();
    assert_eq!(last_state, state::ERROR);
    assert_eq!(last_status.state, state::ERROR);
    assert!(last_status.error_message.contains("invalid flavor type"));
}

#[tokio::test(start_paused = true)]
async fn delete_event_tears_the_instance_down() {
    let calls: CallLog = Arc::default();
    let cluster = FakeCluster::new(calls.clone());
    let db = FakeDatabase::new(calls.clone(), vec![]);
    let (reconciler, handler, store, _hub_api, notifier, _queue) =
        wire_reconciler(cluster.clone(), db.clone());

    // Create first so there is something to tear down.
    let hub = hub("t1");
    store.write().await.insert(hub.key(), hub.clone());
    reconciler.step(&hub.key()).await;
    assert!(cluster.namespace_exists("t1").await.unwrap());

    // Cache entry disappears, delete event records the tombstone.
    store.write().await.remove(&hub.key());
    handler.on_delete(&hub).await;
    reconciler.step(&hub.key()).await;

    assert!(!cluster.namespace_exists("t1").await.unwrap());
    let calls = calls.lock().unwrap();
    assert!(first_index(&calls, "delete_pv t1-postgres-pv").is_some());
    assert!(first_index(&calls, "delete_cluster_role_binding hub-t1-admin").is_some());
    assert!(notifier.calls.lock().unwrap().iter().any(|c| c == "notify"));
}

#[tokio::test(start_paused = true)]
async fn monitor_repairs_drifted_database_exactly_once() {
    let calls: CallLog = Arc::default();
    let cluster = FakeCluster::new(calls.clone());
    // First probe sees the reset database, everything after is healthy.
    let db = FakeDatabase::new(calls.clone(), vec![ProbeOutcome::SchemaMissing]);
    let (reconciler, _handler, store, _hub_api, _notifier, _queue) =
        wire_reconciler(cluster.clone(), db.clone());

    // Persistent storage keeps the reconciler from attaching its own
    // watchdog; the one under test drives every tick explicitly.
    let mut hub = hub("t1");
    hub.spec.persistent_storage = true;
    store.write().await.insert(hub.key(), hub.clone());
    reconciler.step(&hub.key()).await;
    calls.lock().unwrap().clear();

    let monitor = HealthMonitor::new(
        cluster.clone(),
        db,
        store.clone(),
        Duration::from_secs(180),
    );
    assert!(monitor.tick("t1").await.unwrap());
    assert!(monitor.tick("t1").await.unwrap());

    let calls = calls.lock().unwrap();
    let inits = calls.iter().filter(|c| c.starts_with("init_schema")).count();
    assert_eq!(inits, 1, "exactly one repair cycle");

    // The application tier went to zero and came back; postgres was never
    // touched.
    assert!(calls.iter().any(|c| c == "scale_deployment t1/webapp 0"));
    assert!(calls.iter().any(|c| c == "scale_deployment t1/webapp 1"));
    assert!(calls.iter().any(|c| c == "scale_deployment t1/jobrunner 0"));
    assert!(calls.iter().any(|c| c == "scale_deployment t1/jobrunner 1"));
    assert!(!calls.iter().any(|c| c.starts_with("scale_deployment t1/postgres")));

    let down = first_index(&calls, "scale_deployment t1/webapp 0").unwrap();
    let init = first_index(&calls, "init_schema").unwrap();
    let up = first_index(&calls, "scale_deployment t1/webapp 1").unwrap();
    assert!(down < init && init < up);
}

#[tokio::test(start_paused = true)]
async fn database_gate_waits_for_ready_endpoints() {
    let calls: CallLog = Arc::default();
    let cluster = FakeCluster::new(calls.clone());
    let db = FakeDatabase::new(calls.clone(), vec![]);
    // Postgres pod comes up before it accepts connections: the first two
    // endpoint checks report nothing ready.
    cluster.delay_endpoints(2);
    let orch = orchestrator(cluster, db);

    orch.create_hub(&hub_spec("t1")).await.expect("create");

    let calls = calls.lock().unwrap();
    let checks = calls
        .iter()
        .filter(|c| c.as_str() == "endpoints t1/postgres")
        .count();
    assert_eq!(checks, 3, "gate repolls until an endpoint is ready");
    let last_check = calls
        .iter()
        .rposition(|c| c == "endpoints t1/postgres")
        .unwrap();
    let init = first_index(&calls, "init_schema").unwrap();
    assert!(last_check < init, "schema init only after endpoint readiness");
}

fn certificate_source(ns: &str, version: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some("hub-certificate".to_string()),
            namespace: Some(ns.to_string()),
            resource_version: Some(version.to_string()),
            ..Default::default()
        },
        string_data: Some(BTreeMap::from([(
            "tls.crt".to_string(),
            format!("PEM-{version}"),
        )])),
        ..Default::default()
    }
}

#[tokio::test]
async fn replicator_updates_each_dependent_once_per_source_version() {
    let calls: CallLog = Arc::default();
    let cluster = FakeCluster::new(calls.clone());
    let store: Store<Hub> = Arc::new(RwLock::new(HashMap::new()));
    let mut dependent = hub("t1");
    dependent.spec.certificate_name = Some("shared".to_string());
    store.write().await.insert(dependent.key(), dependent);
    let replicator = SecretReplicator::new(cluster.clone(), store);

    let apply_count = || {
        calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with("apply_secret t1/hub-certificate"))
            .count()
    };

    let source = certificate_source("shared", "7");
    replicator.on_add(&source).await;
    assert_eq!(apply_count(), 1, "first sight of the source replicates");

    // Replays of the same source version are no-ops.
    replicator.on_update(&source, &source).await;
    replicator.on_update(&source, &source).await;
    assert_eq!(apply_count(), 1, "unchanged source version is not re-applied");

    let bumped = certificate_source("shared", "8");
    replicator.on_update(&source, &bumped).await;
    assert_eq!(apply_count(), 2, "new version updates the dependent once");
    replicator.on_update(&bumped, &bumped).await;
    assert_eq!(apply_count(), 2);
}

#[tokio::test]
async fn deleting_a_hub_stops_certificate_replication() {
    let calls: CallLog = Arc::default();
    let cluster = FakeCluster::new(calls.clone());
    let store: Store<Hub> = Arc::new(RwLock::new(HashMap::new()));
    let mut dependent = hub("t1");
    dependent.spec.certificate_name = Some("shared".to_string());
    let key = dependent.key();
    store.write().await.insert(key.clone(), dependent);
    let replicator = SecretReplicator::new(cluster.clone(), store.clone());

    let source = certificate_source("shared", "7");
    replicator.on_add(&source).await;

    // Instance torn down; its namespace must drop out of the fan-out.
    store.write().await.remove(&key);
    let bumped = certificate_source("shared", "8");
    replicator.on_update(&source, &bumped).await;

    let applies = calls
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c.starts_with("apply_secret t1/hub-certificate"))
        .count();
    assert_eq!(applies, 1, "no replication to a deleted instance");
}

#[tokio::test]
async fn deleting_a_source_revokes_replica_data() {
    let calls: CallLog = Arc::default();
    let cluster = FakeCluster::new(calls.clone());
    let store: Store<Hub> = Arc::new(RwLock::new(HashMap::new()));
    let mut dependent = hub("t1");
    dependent.spec.certificate_name = Some("shared".to_string());
    store.write().await.insert(dependent.key(), dependent);
    let replicator = SecretReplicator::new(cluster.clone(), store);

    let source = certificate_source("shared", "7");
    replicator.on_add(&source).await;
    assert!(cluster
        .get_secret("t1", "hub-certificate")
        .await
        .unwrap()
        .unwrap()
        .string_data
        .is_some());

    replicator.on_delete(&source).await;
    let replica = cluster.get_secret("t1", "hub-certificate").await.unwrap().unwrap();
    assert!(replica.data.is_none());
    assert!(replica.string_data.is_none());
}

#[tokio::test(start_paused = true)]
async fn event_burst_never_overlaps_reconciles_of_one_key() {
    let calls: CallLog = Arc::default();
    let cluster = FakeCluster::new(calls.clone());
    let db = FakeDatabase::new(calls.clone(), vec![]);
    let (reconciler, handler, store, hub_api, _notifier, queue) = wire_reconciler(cluster, db);

    let names = ["t1", "t2", "t3"];
    for name in names {
        let hub = hub(name);
        store.write().await.insert(hub.key(), hub);
    }

    let inflight: Arc<Mutex<HashMap<String, u32>>> = Arc::default();
    let overlapped = Arc::new(AtomicBool::new(false));

    let mut workers = Vec::new();
    for _ in 0..3 {
        let queue = Arc::clone(&queue);
        let reconciler = Arc::clone(&reconciler);
        let inflight = Arc::clone(&inflight);
        let overlapped = Arc::clone(&overlapped);
        workers.push(tokio::spawn(async move {
            while let Some(key) = queue.get().await {
                {
                    let mut map = inflight.lock().unwrap();
                    let count = map.entry(key.clone()).or_insert(0);
                    *count += 1;
                    if *count > 1 {
                        overlapped.store(true, Ordering::SeqCst);
                    }
                }
                reconciler.step(&key).await;
                *inflight.lock().unwrap().get_mut(&key).unwrap() -= 1;
                queue.done(&key).await;
            }
        }));
    }

    // Burst of redundant events across the keys with jittered spacing, so
    // deliveries land while earlier reconciles are still in flight.
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..60 {
        let name = names[rng.gen_range(0..names.len())];
        let hub = store
            .read()
            .await
            .get(&format!("hub-system/{name}"))
            .cloned()
            .unwrap();
        handler.on_update(&hub, &hub).await;
        tokio::time::sleep(Duration::from_millis(rng.gen_range(0..5))).await;
    }

    queue.shut_down().await;
    for worker in workers {
        worker.await.unwrap();
    }

    assert!(
        !overlapped.load(Ordering::SeqCst),
        "a key was reconciled by two workers at once"
    );
    let transitions = hub_api.transitions.lock().unwrap();
    let running = transitions
        .iter()
        .filter(|(s, _)| s == state::RUNNING)
        .count();
    assert!(running >= names.len(), "every instance reached running");
}

#[tokio::test(start_paused = true)]
async fn monitor_exits_when_the_instance_is_gone() {
    let calls: CallLog = Arc::default();
    let cluster = FakeCluster::new(calls.clone());
    let db = FakeDatabase::new(calls.clone(), vec![]);
    let store: Store<Hub> = Arc::new(RwLock::new(HashMap::new()));
    let monitor = HealthMonitor::new(cluster, db, store, Duration::from_secs(180));

    // Namespace never existed.
    assert!(!monitor.tick("ghost").await.unwrap());
}
