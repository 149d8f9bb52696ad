//! Dependent-tier object builders.
//!
//! Phase 2 of instance creation: the stateless application services layered
//! on top of the bootstrap tier. Every container is wired to the instance
//! config maps through `envFrom`; the database-facing ones additionally get
//! the role passwords from the credentials secret.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapEnvSource, Container, ContainerPort, EnvFromSource, EnvVar, PodSpec,
    PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::bootstrap::{
    component_image, labels, password_env, resource_limits, ADMIN_PASSWORD_KEY, DB_CONFIG_MAP,
    HUB_CONFIG_MAP, USER_PASSWORD_KEY,
};
use crate::flavor::ContainerFlavor;
use crate::HubSpec;

/// Internal ClusterIP service fronting the web tier; also the DNS name other
/// Hubs federate against.
pub const WEBSERVER_SERVICE: &str = "webserver";
/// NodePort twin, the address fallback on clusters without load balancers.
pub const WEBSERVER_NODEPORT_SERVICE: &str = "webserver-np";
/// LoadBalancer twin, the preferred externally reachable address.
pub const WEBSERVER_LB_SERVICE: &str = "webserver-lb";

pub const REGISTRATION_COMPONENT: &str = "registration";

const WEBSERVER_PORT: i32 = 8443;

struct Component {
    name: &'static str,
    replicas: i32,
    memory: &'static str,
    cpu: Option<&'static str>,
    max_heap: Option<&'static str>,
    port: Option<i32>,
    needs_db: bool,
}

fn components(flavor: &ContainerFlavor) -> Vec<Component> {
    vec![
        Component {
            name: "cfssl",
            replicas: 1,
            memory: flavor.cfssl_memory_limit,
            cpu: None,
            max_heap: None,
            port: Some(8888),
            needs_db: false,
        },
        Component {
            name: "webserver",
            replicas: 1,
            memory: flavor.webserver_memory_limit,
            cpu: None,
            max_heap: None,
            port: Some(WEBSERVER_PORT),
            needs_db: false,
        },
        Component {
            name: "documentation",
            replicas: 1,
            memory: flavor.documentation_memory_limit,
            cpu: None,
            max_heap: None,
            port: Some(8443),
            needs_db: false,
        },
        Component {
            name: "solr",
            replicas: 1,
            memory: flavor.search_memory_limit,
            cpu: None,
            max_heap: None,
            port: Some(8983),
            needs_db: false,
        },
        Component {
            name: REGISTRATION_COMPONENT,
            replicas: 1,
            memory: flavor.registration_memory_limit,
            cpu: None,
            max_heap: None,
            port: Some(8443),
            needs_db: false,
        },
        Component {
            name: "zookeeper",
            replicas: 1,
            memory: flavor.zookeeper_memory_limit,
            cpu: None,
            max_heap: None,
            port: Some(2181),
            needs_db: false,
        },
        Component {
            name: "jobrunner",
            replicas: flavor.jobrunner_replicas,
            memory: flavor.jobrunner_memory_limit,
            cpu: None,
            max_heap: Some(flavor.jobrunner_max_heap),
            port: None,
            needs_db: true,
        },
        Component {
            name: "scan",
            replicas: flavor.scan_replicas,
            memory: flavor.scan_memory_limit,
            cpu: None,
            max_heap: Some(flavor.scan_max_heap),
            port: Some(8443),
            needs_db: true,
        },
        Component {
            name: "authentication",
            replicas: 1,
            memory: flavor.authentication_memory_limit,
            cpu: None,
            max_heap: Some(flavor.authentication_max_heap),
            port: Some(8443),
            needs_db: true,
        },
        Component {
            name: "webapp",
            replicas: 1,
            memory: flavor.webapp_memory_limit,
            cpu: Some(flavor.webapp_cpu_limit),
            max_heap: Some(flavor.webapp_max_heap),
            port: Some(8443),
            needs_db: true,
        },
        Component {
            name: "logstash",
            replicas: 1,
            memory: flavor.logstash_memory_limit,
            cpu: None,
            max_heap: None,
            port: Some(5044),
            needs_db: false,
        },
    ]
}

fn config_env_from() -> Vec<EnvFromSource> {
    [HUB_CONFIG_MAP, DB_CONFIG_MAP]
        .into_iter()
        .map(|name| EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource {
                name: name.to_string(),
                optional: None,
            }),
            ..Default::default()
        })
        .collect()
}

fn component_deployment(spec: &HubSpec, component: &Component) -> Deployment {
    let mut env = Vec::new();
    if let Some(heap) = component.max_heap {
        env.push(EnvVar {
            name: "HUB_MAX_MEMORY".to_string(),
            value: Some(heap.to_string()),
            ..Default::default()
        });
    }
    if component.needs_db {
        env.push(password_env("HUB_POSTGRES_ADMIN_PASSWORD_FILE", ADMIN_PASSWORD_KEY));
        env.push(password_env("HUB_POSTGRES_USER_PASSWORD_FILE", USER_PASSWORD_KEY));
    }
    let container = Container {
        name: component.name.to_string(),
        image: Some(component_image(spec, component.name)),
        env: (!env.is_empty()).then_some(env),
        env_from: Some(config_env_from()),
        ports: component.port.map(|port| {
            vec![ContainerPort {
                container_port: port,
                ..Default::default()
            }]
        }),
        resources: Some(resource_limits(component.memory, component.cpu)),
        ..Default::default()
    };
    Deployment {
        metadata: ObjectMeta {
            name: Some(component.name.to_string()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(labels(component.name)),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(component.replicas),
            selector: LabelSelector {
                match_labels: Some(labels(component.name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(component.name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// All dependent-tier deployments for an instance, flavor-sized.
pub fn dependent_deployments(spec: &HubSpec, flavor: &ContainerFlavor) -> Vec<Deployment> {
    components(flavor)
        .iter()
        .map(|c| component_deployment(spec, c))
        .collect()
}

fn simple_service(
    namespace: &str,
    name: &str,
    selector: BTreeMap<String, String>,
    port: i32,
    target_port: i32,
    type_: Option<&str>,
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(selector.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            type_: type_.map(String::from),
            ports: Some(vec![ServicePort {
                name: Some(name.to_string()),
                port,
                target_port: Some(IntOrString::Int(target_port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// All dependent-tier services, including the webserver's
/// ClusterIP/NodePort/LoadBalancer trio used for address resolution.
pub fn dependent_services(spec: &HubSpec, flavor: &ContainerFlavor) -> Vec<Service> {
    let ns = &spec.namespace;
    let mut services: Vec<Service> = components(flavor)
        .iter()
        .filter(|c| c.name != "webserver")
        .filter_map(|c| {
            c.port
                .map(|port| simple_service(ns, c.name, labels(c.name), port, port, None))
        })
        .collect();
    let web = labels("webserver");
    services.push(simple_service(ns, WEBSERVER_SERVICE, web.clone(), 443, WEBSERVER_PORT, None));
    services.push(simple_service(
        ns,
        WEBSERVER_NODEPORT_SERVICE,
        web.clone(),
        443,
        WEBSERVER_PORT,
        Some("NodePort"),
    ));
    services.push(simple_service(
        ns,
        WEBSERVER_LB_SERVICE,
        web,
        443,
        WEBSERVER_PORT,
        Some("LoadBalancer"),
    ));
    services
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flavor::flavor_profile;

    fn spec() -> HubSpec {
        HubSpec {
            namespace: "t1".into(),
            flavor: "large".into(),
            version: "5.0.2".into(),
            docker_registry: "docker.io".into(),
            docker_repo: "hubapp".into(),
            ..Default::default()
        }
    }

    #[test]
    fn flavor_drives_replicas_and_limits() {
        let flavor = flavor_profile("large").unwrap();
        let deployments = dependent_deployments(&spec(), flavor);
        let jobrunner = deployments
            .iter()
            .find(|d| d.metadata.name.as_deref() == Some("jobrunner"))
            .unwrap();
        assert_eq!(jobrunner.spec.as_ref().unwrap().replicas, Some(6));
    }

    #[test]
    fn db_components_reference_the_credentials_secret() {
        let flavor = flavor_profile("small").unwrap();
        let deployments = dependent_deployments(&spec(), flavor);
        let scan = deployments
            .iter()
            .find(|d| d.metadata.name.as_deref() == Some("scan"))
            .unwrap();
        let env = scan.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
            .env
            .as_ref()
            .unwrap();
        assert!(env.iter().any(|e| e.name == "HUB_POSTGRES_USER_PASSWORD_FILE"));
    }

    #[test]
    fn webserver_exposes_all_three_service_variants() {
        let flavor = flavor_profile("small").unwrap();
        let services = dependent_services(&spec(), flavor);
        for name in [WEBSERVER_SERVICE, WEBSERVER_NODEPORT_SERVICE, WEBSERVER_LB_SERVICE] {
            assert!(
                services.iter().any(|s| s.metadata.name.as_deref() == Some(name)),
                "missing service {name}"
            );
        }
        // Batch workers have no service.
        assert!(!services.iter().any(|s| s.metadata.name.as_deref() == Some("jobrunner")));
    }
}
