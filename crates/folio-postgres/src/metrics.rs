//! Metrics for the PostgreSQL stores
//!
//! Every public store operation records one observation:
//! - `folio_store_operations_total{store,operation,outcome}`
//! - `folio_store_operation_duration_seconds{store,operation}`
//!
//! Plus migration bookkeeping for the admin schema.

use folio_core::{Error, ErrorKind};
use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;
use std::time::Instant;

/// Metrics collector shared by every store built on one `SpaceDb`
#[derive(Clone)]
pub struct StoreMetrics {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// Store operations by outcome
    pub operations_total: CounterVec,
    /// Store operation duration
    pub operation_duration_seconds: HistogramVec,

    /// Applied migrations count
    pub migrations_applied_total: GaugeVec,
    /// Migration duration
    pub migration_duration_seconds: HistogramVec,
}

impl StoreMetrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let operations_total = CounterVec::new(
            Opts::new(
                "folio_store_operations_total",
                "Total number of store operations by outcome",
            ),
            &["store", "operation", "outcome"],
        )?;

        let operation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "folio_store_operation_duration_seconds",
                "Store operation duration in seconds",
            )
            .buckets(vec![
                0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
            &["store", "operation"],
        )?;

        let migrations_applied_total = GaugeVec::new(
            Opts::new(
                "folio_store_migrations_applied_total",
                "Total number of applied admin migrations",
            ),
            &["schema"],
        )?;

        let migration_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "folio_store_migration_duration_seconds",
                "Migration execution duration in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            &["migration_version"],
        )?;

        registry.register(Box::new(operations_total.clone()))?;
        registry.register(Box::new(operation_duration_seconds.clone()))?;
        registry.register(Box::new(migrations_applied_total.clone()))?;
        registry.register(Box::new(migration_duration_seconds.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            operations_total,
            operation_duration_seconds,
            migrations_applied_total,
            migration_duration_seconds,
        })
    }

    /// Get the Prometheus registry for exporting metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Snapshot of every metric family
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Record the outcome and latency of one store operation
    pub fn observe<T>(
        &self,
        store: &str,
        operation: &str,
        started: Instant,
        result: &folio_core::Result<T>,
    ) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(err) => outcome_label(err),
        };
        self.operations_total
            .with_label_values(&[store, operation, outcome])
            .inc();
        self.operation_duration_seconds
            .with_label_values(&[store, operation])
            .observe(started.elapsed().as_secs_f64());
    }

    /// Update migration metrics
    pub fn update_migration_metrics(&self, schema: &str, count: usize) {
        self.migrations_applied_total
            .with_label_values(&[schema])
            .set(count as f64);
    }

    /// Record a migration execution
    pub fn record_migration(&self, version: i32, duration_secs: f64) {
        self.migration_duration_seconds
            .with_label_values(&[&version.to_string()])
            .observe(duration_secs);
    }
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::new().expect("Failed to create store metrics")
    }
}

fn outcome_label(err: &Error) -> &'static str {
    match err.kind() {
        ErrorKind::NotFound => "not_found",
        ErrorKind::Conflict => "conflict",
        ErrorKind::Validation => "invalid",
        ErrorKind::PermissionDenied => "denied",
        ErrorKind::Internal => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_value(metrics: &StoreMetrics, labels: &[(&str, &str)]) -> Option<f64> {
        let gathered = metrics.gather();
        let family = gathered
            .iter()
            .find(|m| m.name() == "folio_store_operations_total")?;
        family
            .metric
            .iter()
            .find(|m| {
                labels.iter().all(|(name, value)| {
                    m.label
                        .iter()
                        .any(|l| l.name() == *name && l.value() == *value)
                })
            })
            .and_then(|m| m.counter.as_ref().and_then(|c| c.value))
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = StoreMetrics::new().unwrap();
        metrics.update_migration_metrics("folio_admin", 3);
        assert!(!metrics.gather().is_empty());
    }

    #[test]
    fn test_observe_labels_outcome() {
        let metrics = StoreMetrics::new().unwrap();
        let ok: folio_core::Result<()> = Ok(());
        let missing: folio_core::Result<()> = Err(Error::NotFound("x".into()));

        metrics.observe("entity", "get", Instant::now(), &ok);
        metrics.observe("entity", "get", Instant::now(), &ok);
        metrics.observe("entity", "get", Instant::now(), &missing);

        assert_eq!(
            counter_value(&metrics, &[("operation", "get"), ("outcome", "ok")]),
            Some(2.0)
        );
        assert_eq!(
            counter_value(&metrics, &[("operation", "get"), ("outcome", "not_found")]),
            Some(1.0)
        );
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(outcome_label(&Error::AlreadyExists("x".into())), "conflict");
        assert_eq!(outcome_label(&Error::TenantRequired("x".into())), "invalid");
        assert_eq!(outcome_label(&Error::Database("x".into())), "error");
    }
}
