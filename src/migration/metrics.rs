//! Migration metrics
//!
//! Prometheus collectors for migration outcomes. Registered into a caller
//! supplied registry; the binary uses the process default so `/metrics`
//! serves them.

use crate::error::{Error, Result};
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::time::Duration;

/// Collectors updated by the orchestrator
#[derive(Clone)]
pub struct MigrationMetrics {
    volumes: IntCounterVec,
    relocation_seconds: Histogram,
    restore_failures: IntCounter,
}

impl MigrationMetrics {
    pub fn new() -> Result<Self> {
        let volumes = IntCounterVec::new(
            Opts::new(
                "vcenter_migration_volumes_total",
                "Volumes that reached a terminal migration state",
            ),
            &["result"],
        )
        .map_err(metrics_error)?;

        let relocation_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "vcenter_migration_relocation_seconds",
                "Duration of cross-vCenter carrier VM relocations",
            )
            .buckets(vec![30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 3600.0]),
        )
        .map_err(metrics_error)?;

        let restore_failures = IntCounter::new(
            "vcenter_migration_restore_failures_total",
            "Workload restores that failed after a migration attempt",
        )
        .map_err(metrics_error)?;

        Ok(Self {
            volumes,
            relocation_seconds,
            restore_failures,
        })
    }

    /// Create and register into `registry`
    pub fn register(registry: &Registry) -> Result<Self> {
        let metrics = Self::new()?;
        registry
            .register(Box::new(metrics.volumes.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(metrics.relocation_seconds.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(metrics.restore_failures.clone()))
            .map_err(metrics_error)?;
        Ok(metrics)
    }

    pub fn record_completed(&self) {
        self.volumes.with_label_values(&["completed"]).inc();
    }

    pub fn record_failed(&self) {
        self.volumes.with_label_values(&["failed"]).inc();
    }

    pub fn observe_relocation(&self, duration: Duration) {
        self.relocation_seconds.observe(duration.as_secs_f64());
    }

    pub fn record_restore_failure(&self) {
        self.restore_failures.inc();
    }

    pub fn completed(&self) -> u64 {
        self.volumes.with_label_values(&["completed"]).get()
    }

    pub fn failed(&self) -> u64 {
        self.volumes.with_label_values(&["failed"]).get()
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_gather() {
        let registry = Registry::new();
        let metrics = MigrationMetrics::register(&registry).unwrap();

        metrics.record_completed();
        metrics.record_completed();
        metrics.record_failed();
        metrics.observe_relocation(Duration::from_secs(90));

        assert_eq!(metrics.completed(), 2);
        assert_eq!(metrics.failed(), 1);

        let names: Vec<_> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"vcenter_migration_volumes_total".to_string()));
        assert!(names.contains(&"vcenter_migration_relocation_seconds".to_string()));

        // registering twice into the same registry is rejected
        assert!(MigrationMetrics::register(&registry).is_err());
    }
}
