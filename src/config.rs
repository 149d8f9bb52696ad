//! Operator configuration.
//!
//! Loaded once at startup from a JSON file (`--config`), with the handful of
//! values the deployment environment owns (`REGISTRATION_KEY`,
//! `METRICS_PORT`, `POD_NAMESPACE`) read from environment variables.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "hub-operator", about = "Kubernetes operator for Hub instances")]
pub struct Args {
    /// Path to the operator configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

/// Operator configuration, deserialized from JSON.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorConfig {
    /// Namespace the operator itself runs in; Hub resources are watched here.
    pub namespace: String,
    /// Number of concurrent reconciliation workers draining the work queue.
    pub threadiness: usize,
    /// Base URL of the downstream federator aggregating Hub addresses.
    pub federator_base_url: String,
    /// Minutes between database drift checks per running instance.
    pub postgres_restart_in_mins: u64,
    /// Attempts x interval bound for the post-apply pod validation poll.
    pub pod_wait_attempts: u32,
    pub pod_wait_interval_secs: u64,
    /// Whether the cluster supports OpenShift routes for address resolution.
    pub openshift_routes: bool,
    /// Default spec profile merged under every freshly created Hub.
    pub hub_defaults: HubDefaults,
}

/// Default values merged into a Hub spec before reconciliation. Spec fields
/// that are set win; unset fields fall back to these.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubDefaults {
    pub flavor: String,
    pub version: String,
    pub docker_registry: String,
    pub docker_repo: String,
    pub pvc_claim_size: String,
    pub backup_interval: String,
    pub backup_unit: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: "hub-system".to_string(),
            threadiness: 5,
            federator_base_url: "http://hub-federator:3016".to_string(),
            postgres_restart_in_mins: 3,
            pod_wait_attempts: 30,
            pod_wait_interval_secs: 10,
            openshift_routes: false,
            hub_defaults: HubDefaults::default(),
        }
    }
}

impl Default for HubDefaults {
    fn default() -> Self {
        Self {
            flavor: "small".to_string(),
            version: "5.0.2".to_string(),
            docker_registry: "docker.io".to_string(),
            docker_repo: "hubapp".to_string(),
            pvc_claim_size: "20Gi".to_string(),
            backup_interval: "1".to_string(),
            backup_unit: "Hour(s)".to_string(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from an optional JSON file, then apply environment
    /// overrides.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    Error::InvalidConfig(format!("unable to read {}: {}", path.display(), e))
                })?;
                serde_json::from_str(&raw)?
            }
            None => Self::default(),
        };

        if let Ok(ns) = std::env::var("POD_NAMESPACE") {
            config.namespace = ns;
        }

        Ok(config)
    }

    /// Registration key enabling auto-registration of new instances. Absence
    /// makes registration a documented no-op.
    pub fn registration_key() -> Option<String> {
        std::env::var("REGISTRATION_KEY").ok().filter(|k| !k.is_empty())
    }

    /// Port for the metrics/probes HTTP server.
    pub fn metrics_port() -> u16 {
        std::env::var("METRICS_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080)
    }
}
