//! Cluster access layer.
//!
//! [`ClusterApi`] is the seam between the orchestration logic and the
//! Kubernetes API: everything the reconciler, monitor and replicator do to
//! the cluster goes through this trait, so tests can substitute an in-memory
//! fake and assert on the exact sequence of operations.
//!
//! [`KubeCluster`] is the live implementation. All "apply" operations use
//! server-side apply with a fixed field manager, making them idempotent.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ConfigMap, Endpoints, Namespace, PersistentVolume, PersistentVolumeClaim, Pod, Secret,
    Service,
};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Client, ResourceExt};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::{Error, Result};

/// Field manager for all server-side apply patches.
pub const FIELD_MANAGER: &str = "hub-operator";

/// Everything the operator does to a cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn namespace_exists(&self, name: &str) -> Result<bool>;
    async fn ensure_namespace(&self, name: &str) -> Result<()>;
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    async fn apply_secret(&self, namespace: &str, secret: Secret) -> Result<()>;
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
    /// Remove the entire `data` map from a secret, leaving the object in
    /// place for its owner to repopulate.
    async fn clear_secret_data(&self, namespace: &str, name: &str) -> Result<()>;

    async fn apply_config_map(&self, namespace: &str, config_map: ConfigMap) -> Result<()>;

    async fn apply_pvc(&self, namespace: &str, pvc: PersistentVolumeClaim) -> Result<()>;
    async fn get_pvc(&self, namespace: &str, name: &str)
        -> Result<Option<PersistentVolumeClaim>>;
    async fn apply_pv(&self, pv: PersistentVolume) -> Result<()>;
    async fn delete_pv(&self, name: &str) -> Result<()>;

    async fn apply_deployment(&self, namespace: &str, deployment: Deployment) -> Result<()>;
    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>>;
    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;

    async fn apply_service(&self, namespace: &str, service: Service) -> Result<()>;
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;
    /// Whether the service currently has at least one ready endpoint
    /// address. A pod can be Running and still not be in here, so this is
    /// the gate for "accepting connections".
    async fn service_has_ready_endpoints(&self, namespace: &str, name: &str) -> Result<bool>;

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>>;
    /// Run a command in a pod container and return its stdout.
    async fn pod_exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[&str],
    ) -> Result<String>;

    async fn create_job(&self, namespace: &str, job: Job) -> Result<()>;
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()>;

    /// Host of an OpenShift route, when the cluster has routes at all.
    async fn route_host(&self, namespace: &str, name: &str) -> Result<Option<String>>;
}

/// Live implementation backed by a [`kube::Client`].
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl std::fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCluster").finish_non_exhaustive()
    }
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn apply_params() -> PatchParams {
        PatchParams::apply(FIELD_MANAGER).force()
    }

    /// Treat 404 on delete as success; the object being gone is the goal.
    fn ignore_not_found<T>(result: kube::Result<T>) -> Result<()> {
        match result {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        api.patch(name, &Self::apply_params(), &Patch::Apply(&ns)).await?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Self::ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn apply_secret(&self, namespace: &str, secret: Secret) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = secret.name_any();
        api.patch(&name, &Self::apply_params(), &Patch::Apply(&secret)).await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn clear_secret_data(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        // Merge patch with an explicit null drops the whole data map.
        let patch = json!({ "data": null });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }

    async fn apply_config_map(&self, namespace: &str, config_map: ConfigMap) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let name = config_map.name_any();
        api.patch(&name, &Self::apply_params(), &Patch::Apply(&config_map)).await?;
        Ok(())
    }

    async fn apply_pvc(&self, namespace: &str, pvc: PersistentVolumeClaim) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let name = pvc.name_any();
        api.patch(&name, &Self::apply_params(), &Patch::Apply(&pvc)).await?;
        Ok(())
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply_pv(&self, pv: PersistentVolume) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let name = pv.name_any();
        api.patch(&name, &Self::apply_params(), &Patch::Apply(&pv)).await?;
        Ok(())
    }

    async fn delete_pv(&self, name: &str) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        Self::ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn apply_deployment(&self, namespace: &str, deployment: Deployment) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let name = deployment.name_any();
        api.patch(&name, &Self::apply_params(), &Patch::Apply(&deployment)).await?;
        Ok(())
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "spec": { "replicas": replicas } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        debug!(namespace, name, replicas, "scaled deployment");
        Ok(())
    }

    async fn apply_service(&self, namespace: &str, service: Service) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let name = service.name_any();
        api.patch(&name, &Self::apply_params(), &Patch::Apply(&service)).await?;
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn service_has_ready_endpoints(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        let Some(endpoints) = api.get_opt(name).await? else {
            return Ok(false);
        };
        Ok(endpoints.subsets.unwrap_or_default().iter().any(|subset| {
            subset
                .addresses
                .as_ref()
                .is_some_and(|addresses| !addresses.is_empty())
        }))
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn pod_exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[&str],
    ) -> Result<String> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default()
            .container(container)
            .stdout(true)
            .stderr(false);
        let mut process = api.exec(pod, command.iter().copied(), &params).await?;
        let mut output = String::new();
        if let Some(mut stdout) = process.stdout() {
            stdout
                .read_to_string(&mut output)
                .await
                .map_err(|e| Error::Internal(format!("exec stdout read: {e}")))?;
        }
        process
            .join()
            .await
            .map_err(|e| Error::Internal(format!("exec in {namespace}/{pod}: {e}")))?;
        Ok(output)
    }

    async fn create_job(&self, namespace: &str, job: Job) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let name = job.name_any();
        api.patch(&name, &Self::apply_params(), &Patch::Apply(&job)).await?;
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Self::ignore_not_found(
            api.delete(name, &DeleteParams::background()).await,
        )
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        Self::ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn route_host(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let gvk = GroupVersionKind::gvk("route.openshift.io", "v1", "Route");
        let resource = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        let route = match api.get_opt(name).await {
            Ok(route) => route,
            // No route CRD on vanilla clusters; callers fall through to
            // service-based resolution.
            Err(kube::Error::Api(resp)) if resp.code == 404 => None,
            Err(err) => return Err(err.into()),
        };
        Ok(route.and_then(|r| {
            r.data
                .pointer("/spec/host")
                .and_then(|h| h.as_str())
                .map(String::from)
        }))
    }
}
