//! # Hub Operator
//!
//! A Kubernetes operator that manages the lifecycle of Hub instances: a
//! multi-component application topology (database, web frontend, scanners,
//! job runners, ...) deployed one-per-namespace and declared through a `Hub`
//! custom resource.
//!
//! The operator is built from a small set of cooperating tasks:
//!
//! 1. **Watch bridge** - wraps the list/watch machinery for a resource kind,
//!    keeps a local cache and dispatches typed add/update/delete events.
//! 2. **Work queue** - a rate-limited, deduplicating queue of
//!    `namespace/name` keys that guarantees at most one in-flight
//!    reconciliation per key.
//! 3. **Reconciler** - drives each Hub through its lifecycle
//!    (`pending -> creating -> running | error`) and tears it down on delete.
//! 4. **Deployment orchestrator** - the two-phase apply that creates the
//!    bootstrap tier (namespace, secrets, config, database) and then the
//!    dependent tier of stateless services.
//! 5. **Health monitor** - a per-instance background loop that detects a
//!    silently reset database and repairs it in place.
//! 6. **Federation notifier** - pushes the set of running, verified Hub
//!    addresses to the downstream federator and auto-registers new instances.
//! 7. **Secret replicator** - propagates shared certificate secrets into
//!    dependent Hub namespaces.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod cluster;
pub mod config;
pub mod database;
pub mod deploy;
pub mod error;
pub mod federation;
pub mod flavor;
pub mod metrics;
pub mod monitor;
pub mod poll;
pub mod queue;
pub mod reconciler;
pub mod replicator;
pub mod server;
pub mod watch;

pub use error::{Error, Result};

/// Hub Custom Resource Definition
///
/// A `Hub` declares one full application topology deployed into its own
/// namespace. The operator reconciles the declared spec against live cluster
/// state and reports progress through the status subresource.
///
/// # Example
///
/// ```yaml
/// apiVersion: hubops.io/v1
/// kind: Hub
/// metadata:
///   name: t1
///   namespace: hub-system
/// spec:
///   namespace: t1
///   flavor: small
///   version: "5.0.2"
/// ```
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hubops.io",
    version = "v1",
    kind = "Hub",
    namespaced,
    status = "HubStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Address", "type":"string", "jsonPath":".status.address"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HubSpec {
    /// Target namespace for the instance. Immutable after creation.
    pub namespace: String,
    /// Resource sizing profile: small, medium, large or x-large.
    #[serde(default)]
    pub flavor: String,
    /// Application version (image tag) for all dependent-tier containers.
    #[serde(default)]
    pub version: String,
    /// Registry the application images are pulled from.
    #[serde(default)]
    pub docker_registry: String,
    /// Repository (organisation) under the registry.
    #[serde(default)]
    pub docker_repo: String,
    /// Back the database with a persistent volume claim instead of an
    /// emptyDir. Instances without persistent storage are watched by the
    /// drift monitor, which re-initializes the database after a restart.
    #[serde(default)]
    pub persistent_storage: bool,
    /// Size of the database PVC, e.g. "20Gi".
    #[serde(default)]
    pub pvc_claim_size: Option<String>,
    /// Storage class for the database PVC. The literal value "none" selects
    /// the manually provisioned NFS volume path instead.
    #[serde(default)]
    pub pvc_storage_class: Option<String>,
    /// Access mode for the database PVC ("ReadWriteOnce" or "ReadWriteMany").
    #[serde(default)]
    pub pvc_access_mode: Option<String>,
    /// NFS server backing the manually provisioned persistent volume.
    /// Required when `pvcStorageClass` is "none".
    #[serde(default)]
    pub nfs_server: Option<String>,
    /// Externally managed database. When set, the embedded database
    /// deployment, its bootstrap and the drift monitor are all skipped.
    #[serde(default)]
    pub external_db: Option<ExternalDbConfig>,
    /// Namespace of an existing instance whose database is cloned into this
    /// one instead of running schema initialization. Mutually exclusive with
    /// the init path; ignored when `externalDb` is set.
    #[serde(default)]
    pub db_prototype: Option<String>,
    /// Name of the shared certificate secret replicated into this instance's
    /// namespace. The value "Custom" opts out of replication.
    #[serde(default)]
    pub certificate_name: Option<String>,
    /// Additional `KEY:VALUE` environment overrides applied to the instance
    /// configuration.
    #[serde(default)]
    pub environs: Vec<String>,
    /// Generate random database credentials instead of using the supplied
    /// passwords. Generation uses the operating system CSPRNG.
    #[serde(default)]
    pub is_random_password: bool,
    #[serde(default)]
    pub admin_password: Option<String>,
    #[serde(default)]
    pub user_password: Option<String>,
    #[serde(default)]
    pub postgres_password: Option<String>,
    /// Database dump interval, interpreted against `backupUnit`.
    #[serde(default)]
    pub backup_interval: Option<String>,
    /// Unit for `backupInterval`: "Minute(s)", "Hour(s)" or "Week(s)".
    #[serde(default)]
    pub backup_unit: Option<String>,
    /// Lifecycle mirror written by the operator. An empty state marks a
    /// fresh resource that has never been reconciled.
    #[serde(default)]
    pub state: String,
}

/// Connection coordinates for an externally managed database.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalDbConfig {
    pub host: String,
    pub port: u16,
    pub admin_user: String,
    pub user: String,
}

/// Status of a Hub resource. Owned by the reconciler; the health monitor is
/// the only other writer.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HubStatus {
    /// Lifecycle state: pending, creating, running, error or deleted.
    #[serde(default)]
    pub state: String,
    /// Resolved externally reachable address of the web frontend.
    #[serde(default)]
    pub address: String,
    /// Bound volume name of the database PVC, when persistent storage is on.
    #[serde(default)]
    pub pvc_volume_name: String,
    /// Last terminal reconciliation error, for operator consumption.
    #[serde(default)]
    pub error_message: String,
}

impl Hub {
    /// The idempotency key used throughout the queue and caches.
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }
}

/// Lifecycle states stored in `HubStatus::state` and mirrored into
/// `HubSpec::state`.
pub mod state {
    pub const PENDING: &str = "pending";
    pub const CREATING: &str = "creating";
    pub const RUNNING: &str = "running";
    pub const ERROR: &str = "error";
    pub const DELETED: &str = "deleted";
}
