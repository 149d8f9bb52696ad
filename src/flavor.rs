//! Container resource flavors.
//!
//! A flavor is a named sizing profile applied to every component of an
//! instance: memory/CPU limits, JVM max heap for the heavy services and
//! replica counts for the horizontally scaled ones. The table is static and
//! read-only; an unknown flavor fails the reconciliation fast.

use std::str::FromStr;

/// Named sizing tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Small,
    Medium,
    Large,
    XLarge,
}

impl FromStr for Flavor {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "small" => Ok(Flavor::Small),
            "medium" => Ok(Flavor::Medium),
            "large" => Ok(Flavor::Large),
            "x-large" | "xlarge" => Ok(Flavor::XLarge),
            _ => Err(()),
        }
    }
}

/// Per-component presets for one flavor.
#[derive(Debug, Clone)]
pub struct ContainerFlavor {
    pub webserver_memory_limit: &'static str,
    pub search_memory_limit: &'static str,
    pub webapp_cpu_limit: &'static str,
    pub webapp_memory_limit: &'static str,
    pub webapp_max_heap: &'static str,
    pub scan_replicas: i32,
    pub scan_memory_limit: &'static str,
    pub scan_max_heap: &'static str,
    pub jobrunner_replicas: i32,
    pub jobrunner_memory_limit: &'static str,
    pub jobrunner_max_heap: &'static str,
    pub cfssl_memory_limit: &'static str,
    pub logstash_memory_limit: &'static str,
    pub registration_memory_limit: &'static str,
    pub zookeeper_memory_limit: &'static str,
    pub authentication_memory_limit: &'static str,
    pub authentication_max_heap: &'static str,
    pub documentation_memory_limit: &'static str,
    pub postgres_memory_limit: &'static str,
    pub postgres_cpu_limit: &'static str,
}

/// Resolve a flavor name to its presets. Returns `None` for unknown names;
/// the caller turns that into a terminal configuration error.
pub fn flavor_profile(name: &str) -> Option<&'static ContainerFlavor> {
    match Flavor::from_str(name).ok()? {
        Flavor::Small => Some(&SMALL),
        Flavor::Medium => Some(&MEDIUM),
        Flavor::Large => Some(&LARGE),
        Flavor::XLarge => Some(&X_LARGE),
    }
}

static SMALL: ContainerFlavor = ContainerFlavor {
    webserver_memory_limit: "640M",
    search_memory_limit: "640M",
    webapp_cpu_limit: "1",
    webapp_memory_limit: "2560M",
    webapp_max_heap: "2048m",
    scan_replicas: 1,
    scan_memory_limit: "2560M",
    scan_max_heap: "2048m",
    jobrunner_replicas: 1,
    jobrunner_memory_limit: "4608M",
    jobrunner_max_heap: "4096m",
    cfssl_memory_limit: "640M",
    logstash_memory_limit: "1024M",
    registration_memory_limit: "640M",
    zookeeper_memory_limit: "640M",
    authentication_memory_limit: "1024M",
    authentication_max_heap: "512m",
    documentation_memory_limit: "512M",
    postgres_memory_limit: "3072M",
    postgres_cpu_limit: "1",
};

static MEDIUM: ContainerFlavor = ContainerFlavor {
    webserver_memory_limit: "1024M",
    search_memory_limit: "1024M",
    webapp_cpu_limit: "2",
    webapp_memory_limit: "5120M",
    webapp_max_heap: "4096m",
    scan_replicas: 2,
    scan_memory_limit: "5120M",
    scan_max_heap: "4096m",
    jobrunner_replicas: 4,
    jobrunner_memory_limit: "7168M",
    jobrunner_max_heap: "6144m",
    cfssl_memory_limit: "640M",
    logstash_memory_limit: "1024M",
    registration_memory_limit: "640M",
    zookeeper_memory_limit: "640M",
    authentication_memory_limit: "1024M",
    authentication_max_heap: "512m",
    documentation_memory_limit: "512M",
    postgres_memory_limit: "8192M",
    postgres_cpu_limit: "2",
};

static LARGE: ContainerFlavor = ContainerFlavor {
    webserver_memory_limit: "2048M",
    search_memory_limit: "2048M",
    webapp_cpu_limit: "2",
    webapp_memory_limit: "9728M",
    webapp_max_heap: "8192m",
    scan_replicas: 3,
    scan_memory_limit: "9728M",
    scan_max_heap: "8192m",
    jobrunner_replicas: 6,
    jobrunner_memory_limit: "13824M",
    jobrunner_max_heap: "12288m",
    cfssl_memory_limit: "640M",
    logstash_memory_limit: "1024M",
    registration_memory_limit: "640M",
    zookeeper_memory_limit: "640M",
    authentication_memory_limit: "1024M",
    authentication_max_heap: "512m",
    documentation_memory_limit: "512M",
    postgres_memory_limit: "12288M",
    postgres_cpu_limit: "2",
};

static X_LARGE: ContainerFlavor = ContainerFlavor {
    webserver_memory_limit: "2048M",
    search_memory_limit: "2048M",
    webapp_cpu_limit: "3",
    webapp_memory_limit: "19456M",
    webapp_max_heap: "16384m",
    scan_replicas: 5,
    scan_memory_limit: "9728M",
    scan_max_heap: "8192m",
    jobrunner_replicas: 10,
    jobrunner_memory_limit: "13824M",
    jobrunner_max_heap: "12288m",
    cfssl_memory_limit: "640M",
    logstash_memory_limit: "1024M",
    registration_memory_limit: "640M",
    zookeeper_memory_limit: "640M",
    authentication_memory_limit: "1024M",
    authentication_max_heap: "512m",
    documentation_memory_limit: "512M",
    postgres_memory_limit: "24576M",
    postgres_cpu_limit: "3",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_flavors_resolve() {
        for name in ["small", "Medium", "LARGE", "x-large"] {
            assert!(flavor_profile(name).is_some(), "flavor {name} should resolve");
        }
    }

    #[test]
    fn unknown_flavor_is_rejected() {
        assert!(flavor_profile("tiny").is_none());
        assert!(flavor_profile("").is_none());
    }

    #[test]
    fn replicas_scale_with_tier() {
        let small = flavor_profile("small").unwrap();
        let large = flavor_profile("large").unwrap();
        assert!(large.jobrunner_replicas > small.jobrunner_replicas);
        assert!(large.scan_replicas > small.scan_replicas);
    }
}
