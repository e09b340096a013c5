//! Controller Metrics
//!
//! Prometheus collectors for placements, operation outcomes and capacity.

use crate::error::{Error, Result};
use crate::multishare::{ModelStats, ReconcileReport};
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Metrics exported by the controller
pub struct ControllerMetrics {
    placements: IntCounterVec,
    operations_completed: IntCounterVec,
    backend_errors: IntCounter,
    active_operations: IntGauge,
    failed_operations: IntGauge,
    instances: IntGauge,
    capacity_total: IntGauge,
    capacity_consumed: IntGauge,
}

fn register_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}

impl ControllerMetrics {
    /// Create collectors and register them with `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let placements = IntCounterVec::new(
            Opts::new("multishare_placements_total", "Share placements by decision kind"),
            &["kind"],
        )
        .map_err(register_err)?;
        let operations_completed = IntCounterVec::new(
            Opts::new(
                "multishare_operations_completed_total",
                "Operations reaching a terminal status",
            ),
            &["type", "status"],
        )
        .map_err(register_err)?;
        let backend_errors = IntCounter::new(
            "multishare_backend_errors_total",
            "Failed calls to the operation backend",
        )
        .map_err(register_err)?;
        let active_operations = IntGauge::new(
            "multishare_operations_active",
            "Non-terminal operations in the registry",
        )
        .map_err(register_err)?;
        let failed_operations = IntGauge::new(
            "multishare_operations_failed_retained",
            "Failed operations within their retention window",
        )
        .map_err(register_err)?;
        let instances = IntGauge::new("multishare_instances", "Instances known to the model")
            .map_err(register_err)?;
        let capacity_total = IntGauge::new(
            "multishare_capacity_total_bytes",
            "Sum of instance capacities",
        )
        .map_err(register_err)?;
        let capacity_consumed = IntGauge::new(
            "multishare_capacity_consumed_bytes",
            "Capacity debited to shares",
        )
        .map_err(register_err)?;

        registry.register(Box::new(placements.clone())).map_err(register_err)?;
        registry
            .register(Box::new(operations_completed.clone()))
            .map_err(register_err)?;
        registry.register(Box::new(backend_errors.clone())).map_err(register_err)?;
        registry
            .register(Box::new(active_operations.clone()))
            .map_err(register_err)?;
        registry
            .register(Box::new(failed_operations.clone()))
            .map_err(register_err)?;
        registry.register(Box::new(instances.clone())).map_err(register_err)?;
        registry.register(Box::new(capacity_total.clone())).map_err(register_err)?;
        registry
            .register(Box::new(capacity_consumed.clone()))
            .map_err(register_err)?;

        Ok(Self {
            placements,
            operations_completed,
            backend_errors,
            active_operations,
            failed_operations,
            instances,
            capacity_total,
            capacity_consumed,
        })
    }

    pub fn record_placement(&self, kind: &str) {
        self.placements.with_label_values(&[kind]).inc();
    }

    /// Fold one reconcile pass into the counters
    pub fn record_report(&self, report: &ReconcileReport) {
        for op_type in &report.succeeded {
            self.operations_completed
                .with_label_values(&[op_type.as_str(), "succeeded"])
                .inc();
        }
        for op_type in &report.failed {
            self.operations_completed
                .with_label_values(&[op_type.as_str(), "failed"])
                .inc();
        }
        self.backend_errors.inc_by(report.backend_errors as u64);
    }

    /// Refresh gauges from current state
    pub fn observe_state(&self, stats: &ModelStats, active: usize, failed: usize) {
        self.active_operations.set(active as i64);
        self.failed_operations.set(failed as i64);
        self.instances.set(stats.instances as i64);
        self.capacity_total.set(stats.total_capacity_bytes as i64);
        self.capacity_consumed.set(stats.consumed_capacity_bytes as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multishare::OperationType;

    #[test]
    fn test_record_report() {
        let registry = Registry::new();
        let metrics = ControllerMetrics::new(&registry).unwrap();
        metrics.record_placement("new_instance");
        metrics.record_report(&ReconcileReport {
            succeeded: vec![OperationType::ShareCreate, OperationType::ShareCreate],
            failed: vec![OperationType::InstanceDelete],
            backend_errors: 3,
            ..ReconcileReport::default()
        });

        assert_eq!(
            metrics
                .operations_completed
                .with_label_values(&["sharecreate", "succeeded"])
                .get(),
            2
        );
        assert_eq!(metrics.backend_errors.get(), 3);
        assert_eq!(metrics.placements.with_label_values(&["new_instance"]).get(), 1);
        assert!(!registry.gather().is_empty());
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        let _first = ControllerMetrics::new(&registry).unwrap();
        assert!(ControllerMetrics::new(&registry).is_err());
    }
}
