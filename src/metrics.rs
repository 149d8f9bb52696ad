//! # Metrics
//!
//! Prometheus metrics for monitoring the operator.
//!
//! ## Metrics Exposed
//!
//! - `hub_operator_reconciliations_total` - Reconciliations by outcome
//! - `hub_operator_reconcile_duration_seconds` - Duration of reconciliations
//! - `hub_operator_instances_running` - Current number of running instances
//! - `hub_operator_monitor_repairs_total` - Database repairs performed by the health monitor
//! - `hub_operator_federation_pushes_total` - Successful hub-set pushes to the federator
//! - `hub_operator_secret_replications_total` - Secrets replicated into instance namespaces

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, IntGauge, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "hub_operator_reconciliations_total",
            "Total number of reconciliations by outcome",
        ),
        &["outcome"],
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "hub_operator_reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
    )
    .expect("Failed to create RECONCILE_DURATION metric - this should never happen")
});

static INSTANCES_RUNNING: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "hub_operator_instances_running",
        "Current number of running instances",
    )
    .expect("Failed to create INSTANCES_RUNNING metric - this should never happen")
});

static MONITOR_REPAIRS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "hub_operator_monitor_repairs_total",
        "Total number of database repairs performed by the health monitor",
    )
    .expect("Failed to create MONITOR_REPAIRS_TOTAL metric - this should never happen")
});

static FEDERATION_PUSHES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "hub_operator_federation_pushes_total",
        "Total number of successful hub-set pushes to the federator",
    )
    .expect("Failed to create FEDERATION_PUSHES_TOTAL metric - this should never happen")
});

static SECRET_REPLICATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "hub_operator_secret_replications_total",
        "Total number of secrets replicated into instance namespaces",
    )
    .expect("Failed to create SECRET_REPLICATIONS_TOTAL metric - this should never happen")
});

pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILE_DURATION.clone()))?;
    REGISTRY.register(Box::new(INSTANCES_RUNNING.clone()))?;
    REGISTRY.register(Box::new(MONITOR_REPAIRS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(FEDERATION_PUSHES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SECRET_REPLICATIONS_TOTAL.clone()))?;
    Ok(())
}

pub fn increment_reconciliations(outcome: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn observe_reconcile_duration(duration: f64) {
    RECONCILE_DURATION.observe(duration);
}

pub fn set_instances_running(count: i64) {
    INSTANCES_RUNNING.set(count);
}

pub fn increment_monitor_repairs() {
    MONITOR_REPAIRS_TOTAL.inc();
}

pub fn increment_federation_pushes() {
    FEDERATION_PUSHES_TOTAL.inc();
}

pub fn increment_secret_replications() {
    SECRET_REPLICATIONS_TOTAL.inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_once() {
        register_metrics().expect("registration should succeed");
        increment_reconciliations("success");
        observe_reconcile_duration(1.5);
        set_instances_running(2);
        assert!(REGISTRY.gather().iter().any(|family| {
            family.name() == "hub_operator_reconciliations_total"
        }));
    }
}
