//! Bootstrap-tier object builders.
//!
//! Phase 1 of instance creation: the namespace-scoped foundation everything
//! else depends on. Credentials, config maps, database storage, the embedded
//! postgres deployment and the clone job are all built here as plain
//! `k8s-openapi` objects; the orchestrator decides what to apply.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    NFSVolumeSource, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PersistentVolumeSpec, PodSpec, PodTemplateSpec,
    ResourceRequirements, Secret, SecretKeySelector, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;

use crate::error::{Error, Result};
use crate::flavor::ContainerFlavor;
use crate::HubSpec;

/// Secret holding the database role passwords.
pub const DB_CREDS_SECRET: &str = "db-creds";
pub const ADMIN_PASSWORD_KEY: &str = "HUB_POSTGRES_ADMIN_PASSWORD_FILE";
pub const USER_PASSWORD_KEY: &str = "HUB_POSTGRES_USER_PASSWORD_FILE";
pub const POSTGRES_PASSWORD_KEY: &str = "HUB_POSTGRES_POSTGRES_PASSWORD_FILE";

/// Instance-wide settings consumed by every application container.
pub const HUB_CONFIG_MAP: &str = "hub-config";
/// Database coordinates, shared by the app tier and the monitor.
pub const DB_CONFIG_MAP: &str = "hub-db-config";

pub const POSTGRES_COMPONENT: &str = "postgres";
pub const POSTGRES_CLAIM: &str = "hub-postgres-claim";
pub const CLONE_JOB_NAME: &str = "hub-db-clone";

const GENERATED_PASSWORD_LEN: usize = 16;

/// Resolved database role passwords for one instance.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub admin_password: String,
    pub user_password: String,
    pub postgres_password: String,
}

/// Pick credentials for a new instance: generated from the OS entropy source
/// when requested, otherwise the ones supplied in the spec.
pub fn resolve_credentials(spec: &HubSpec) -> Result<Credentials> {
    if spec.is_random_password {
        return Ok(Credentials {
            admin_password: generate_password(),
            user_password: generate_password(),
            postgres_password: generate_password(),
        });
    }
    let take = |field: &Option<String>, name: &str| -> Result<String> {
        field
            .clone()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::InvalidConfig(format!("{name} is required unless isRandomPassword is set")))
    };
    Ok(Credentials {
        admin_password: take(&spec.admin_password, "adminPassword")?,
        user_password: take(&spec.user_password, "userPassword")?,
        postgres_password: take(&spec.postgres_password, "postgresPassword")?,
    })
}

fn generate_password() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

pub fn labels(component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "hub".to_string()),
        ("component".to_string(), component.to_string()),
    ])
}

fn meta(namespace: &str, name: &str, component: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels(component)),
        ..Default::default()
    }
}

pub fn db_creds_secret(namespace: &str, creds: &Credentials) -> Secret {
    Secret {
        metadata: meta(namespace, DB_CREDS_SECRET, POSTGRES_COMPONENT),
        string_data: Some(BTreeMap::from([
            (ADMIN_PASSWORD_KEY.to_string(), creds.admin_password.clone()),
            (USER_PASSWORD_KEY.to_string(), creds.user_password.clone()),
            (POSTGRES_PASSWORD_KEY.to_string(), creds.postgres_password.clone()),
        ])),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

/// Instance configuration. Spec-level `KEY:VALUE` environs are applied last
/// and override the computed entries.
pub fn hub_config_map(spec: &HubSpec) -> ConfigMap {
    let mut data = BTreeMap::from([
        ("HUB_VERSION".to_string(), spec.version.clone()),
        (
            "PUBLIC_HUB_WEBSERVER_HOST".to_string(),
            format!("webserver.{}.svc", spec.namespace),
        ),
        ("PUBLIC_HUB_WEBSERVER_PORT".to_string(), "443".to_string()),
        ("IPV4_ONLY".to_string(), "0".to_string()),
        ("RUN_SECRETS_DIR".to_string(), "/tmp/secrets".to_string()),
    ]);
    if let (Some(interval), Some(unit)) = (&spec.backup_interval, &spec.backup_unit) {
        data.insert("BACKUP_INTERVAL".to_string(), interval.clone());
        data.insert("BACKUP_UNIT".to_string(), unit.clone());
    }
    for environ in &spec.environs {
        if let Some((key, value)) = environ.split_once(':') {
            data.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    ConfigMap {
        metadata: meta(&spec.namespace, HUB_CONFIG_MAP, "hub"),
        data: Some(data),
        ..Default::default()
    }
}

/// Database coordinates: the embedded service, or the external host when one
/// is declared.
pub fn db_config_map(spec: &HubSpec) -> ConfigMap {
    let (host, port, admin, user) = match &spec.external_db {
        Some(db) => (db.host.clone(), db.port, db.admin_user.clone(), db.user.clone()),
        None => (
            POSTGRES_COMPONENT.to_string(),
            5432,
            crate::database::ADMIN_USER.to_string(),
            crate::database::APP_USER.to_string(),
        ),
    };
    ConfigMap {
        metadata: meta(&spec.namespace, DB_CONFIG_MAP, POSTGRES_COMPONENT),
        data: Some(BTreeMap::from([
            ("HUB_POSTGRES_HOST".to_string(), host),
            ("HUB_POSTGRES_PORT".to_string(), port.to_string()),
            ("HUB_POSTGRES_ADMIN".to_string(), admin),
            ("HUB_POSTGRES_USER".to_string(), user),
            (
                "HUB_POSTGRES_ENABLE_SSL".to_string(),
                spec.external_db.is_some().to_string(),
            ),
        ])),
        ..Default::default()
    }
}

/// The database claim. Access mode falls back to ReadWriteMany when the spec
/// leaves it unset.
pub fn postgres_pvc(spec: &HubSpec, claim_size: &str) -> PersistentVolumeClaim {
    let access_mode = spec
        .pvc_access_mode
        .clone()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "ReadWriteMany".to_string());
    let storage_class = spec
        .pvc_storage_class
        .clone()
        .filter(|c| !c.is_empty() && c != "none");
    let manual = spec.pvc_storage_class.as_deref() == Some("none");
    PersistentVolumeClaim {
        metadata: meta(&spec.namespace, POSTGRES_CLAIM, POSTGRES_COMPONENT),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![access_mode]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(claim_size.to_string()),
                )])),
                ..Default::default()
            }),
            storage_class_name: storage_class.or(manual.then(String::new)),
            volume_name: manual.then(|| manual_pv_name(&spec.namespace)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn manual_pv_name(namespace: &str) -> String {
    format!("{namespace}-postgres-pv")
}

/// Manually provisioned NFS volume for the "none" storage-class path.
pub fn postgres_pv(spec: &HubSpec, claim_size: &str) -> Result<PersistentVolume> {
    let server = spec
        .nfs_server
        .clone()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            Error::InvalidConfig("nfsServer is required when pvcStorageClass is \"none\"".into())
        })?;
    Ok(PersistentVolume {
        metadata: ObjectMeta {
            name: Some(manual_pv_name(&spec.namespace)),
            labels: Some(labels(POSTGRES_COMPONENT)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            capacity: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity(claim_size.to_string()),
            )])),
            access_modes: Some(vec!["ReadWriteMany".to_string()]),
            persistent_volume_reclaim_policy: Some("Retain".to_string()),
            storage_class_name: Some(String::new()),
            nfs: Some(NFSVolumeSource {
                server,
                path: format!("/hub/{}", spec.namespace),
                read_only: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub(super) fn password_env(name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: DB_CREDS_SECRET.to_string(),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(super) fn resource_limits(memory: &str, cpu: Option<&str>) -> ResourceRequirements {
    let mut limits = BTreeMap::from([("memory".to_string(), Quantity(memory.to_string()))]);
    if let Some(cpu) = cpu {
        limits.insert("cpu".to_string(), Quantity(cpu.to_string()));
    }
    ResourceRequirements {
        limits: Some(limits),
        ..Default::default()
    }
}

/// The embedded database. Storage is the claim when persistence is on,
/// otherwise an emptyDir that the drift monitor watches over.
pub fn postgres_deployment(spec: &HubSpec, flavor: &ContainerFlavor) -> Deployment {
    let image = component_image(spec, POSTGRES_COMPONENT);
    let volume = if spec.persistent_storage {
        Volume {
            name: "postgres-data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: POSTGRES_CLAIM.to_string(),
                read_only: None,
            }),
            ..Default::default()
        }
    } else {
        Volume {
            name: "postgres-data".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }
    };
    let container = Container {
        name: POSTGRES_COMPONENT.to_string(),
        image: Some(image),
        env: Some(vec![
            password_env("POSTGRES_PASSWORD", POSTGRES_PASSWORD_KEY),
            EnvVar {
                name: "PGDATA".to_string(),
                value: Some("/var/lib/postgresql/data/pgdata".to_string()),
                ..Default::default()
            },
        ]),
        ports: Some(vec![ContainerPort {
            container_port: 5432,
            ..Default::default()
        }]),
        resources: Some(resource_limits(
            flavor.postgres_memory_limit,
            Some(flavor.postgres_cpu_limit),
        )),
        volume_mounts: Some(vec![VolumeMount {
            name: "postgres-data".to_string(),
            mount_path: "/var/lib/postgresql/data".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };
    Deployment {
        metadata: meta(&spec.namespace, POSTGRES_COMPONENT, POSTGRES_COMPONENT),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels(POSTGRES_COMPONENT)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(POSTGRES_COMPONENT)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![volume]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn postgres_service(namespace: &str) -> Service {
    Service {
        metadata: meta(namespace, POSTGRES_COMPONENT, POSTGRES_COMPONENT),
        spec: Some(ServiceSpec {
            selector: Some(labels(POSTGRES_COMPONENT)),
            ports: Some(vec![ServicePort {
                name: Some("postgres".to_string()),
                port: 5432,
                target_port: Some(IntOrString::Int(5432)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// One-shot job that streams a full dump from the prototype instance's
/// database into this one.
pub fn clone_job(spec: &HubSpec, source_namespace: &str) -> Job {
    let source_host = format!("{POSTGRES_COMPONENT}.{source_namespace}.svc");
    let target_host = format!("{POSTGRES_COMPONENT}.{}.svc", spec.namespace);
    let script = format!(
        "pg_dumpall -h {source_host} -U postgres | psql -h {target_host} -U postgres"
    );
    Job {
        metadata: meta(&spec.namespace, CLONE_JOB_NAME, POSTGRES_COMPONENT),
        spec: Some(JobSpec {
            backoff_limit: Some(2),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels("clone")),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: "clone".to_string(),
                        image: Some(component_image(spec, POSTGRES_COMPONENT)),
                        command: Some(vec![
                            "sh".to_string(),
                            "-c".to_string(),
                            script,
                        ]),
                        env: Some(vec![password_env("PGPASSWORD", POSTGRES_PASSWORD_KEY)]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Image coordinates for one component of this instance.
pub fn component_image(spec: &HubSpec, component: &str) -> String {
    format!(
        "{}/{}/hub-{}:{}",
        spec.docker_registry, spec.docker_repo, component, spec.version
    )
}
