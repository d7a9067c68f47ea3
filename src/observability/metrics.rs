//! # Metrics Collection
//!
//! Components record metrics through the [`MetricStore`] capability rather than
//! calling the `metrics` macros directly, so tests can swap in
//! [`InMemoryMetricStore`] and assert on what was recorded.
//!
//! In production [`PrometheusMetricStore`] forwards to the global `metrics`
//! recorder, and [`MetricsExporter`] owns the Prometheus handle that renders
//! `GET /metrics`.
//!
//! ## Usage Example
//! ```rust,ignore
//! let exporter = MetricsExporter::install()?;
//! let store: Arc<dyn MetricStore> = Arc::new(PrometheusMetricStore);
//! store.increment_counter("gateway_requests_total", &[("service", "user-service".into())]);
//! let text = exporter.render();
//! ```

use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;

/// Label set attached to a single measurement
pub type MetricLabels<'a> = &'a [(&'static str, String)];

/// Errors that can occur while installing the exporter
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Failed to initialize metrics exporter: {0}")]
    InitializationError(String),
}

/// Capability for recording metrics
pub trait MetricStore: Send + Sync {
    fn increment_counter(&self, name: &'static str, labels: MetricLabels<'_>);

    fn set_gauge(&self, name: &'static str, labels: MetricLabels<'_>, value: f64);

    fn record_histogram(&self, name: &'static str, labels: MetricLabels<'_>, value: f64);
}

/// Forwards measurements to the global `metrics` recorder
///
/// Without an installed recorder every call is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetricStore;

impl MetricStore for PrometheusMetricStore {
    fn increment_counter(&self, name: &'static str, labels: MetricLabels<'_>) {
        counter!(name, labels).increment(1);
    }

    fn set_gauge(&self, name: &'static str, labels: MetricLabels<'_>, value: f64) {
        gauge!(name, labels).set(value);
    }

    fn record_histogram(&self, name: &'static str, labels: MetricLabels<'_>, value: f64) {
        histogram!(name, labels).record(value);
    }
}

/// Records measurements in memory, keyed by name and sorted labels
#[derive(Debug, Default)]
pub struct InMemoryMetricStore {
    counters: DashMap<String, u64>,
    gauges: DashMap<String, f64>,
    histograms: DashMap<String, Vec<f64>>,
}

impl InMemoryMetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str, labels: MetricLabels<'_>) -> String {
        if labels.is_empty() {
            return name.to_string();
        }
        let mut pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        pairs.sort();
        format!("{}{{{}}}", name, pairs.join(","))
    }

    pub fn counter(&self, name: &str, labels: MetricLabels<'_>) -> u64 {
        self.counters
            .get(&Self::key(name, labels))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Sum of a counter across every label set
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .iter()
            .filter(|entry| entry.key() == name || entry.key().starts_with(&format!("{}{{", name)))
            .map(|entry| *entry.value())
            .sum()
    }

    pub fn gauge(&self, name: &str, labels: MetricLabels<'_>) -> Option<f64> {
        self.gauges.get(&Self::key(name, labels)).map(|v| *v)
    }

    pub fn histogram(&self, name: &str, labels: MetricLabels<'_>) -> Vec<f64> {
        self.histograms
            .get(&Self::key(name, labels))
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

impl MetricStore for InMemoryMetricStore {
    fn increment_counter(&self, name: &'static str, labels: MetricLabels<'_>) {
        *self.counters.entry(Self::key(name, labels)).or_insert(0) += 1;
    }

    fn set_gauge(&self, name: &'static str, labels: MetricLabels<'_>, value: f64) {
        self.gauges.insert(Self::key(name, labels), value);
    }

    fn record_histogram(&self, name: &'static str, labels: MetricLabels<'_>, value: f64) {
        self.histograms
            .entry(Self::key(name, labels))
            .or_default()
            .push(value);
    }
}

/// Owner of the installed Prometheus recorder
#[derive(Clone)]
pub struct MetricsExporter {
    handle: PrometheusHandle,
}

impl MetricsExporter {
    /// Install the Prometheus recorder as the global `metrics` recorder
    ///
    /// May only succeed once per process.
    pub fn install() -> Result<Self, MetricsError> {
        let latency_buckets = [0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &latency_buckets,
            )
            .map_err(|e| MetricsError::InitializationError(format!("Failed to set histogram buckets: {}", e)))?
            .install_recorder()
            .map_err(|e| MetricsError::InitializationError(e.to_string()))?;

        Ok(Self { handle })
    }

    /// Render the Prometheus text exposition
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_counters_are_keyed_by_labels() {
        let store = InMemoryMetricStore::new();
        let users = [("service", "user-service".to_string())];
        let auth = [("service", "auth-service".to_string())];

        store.increment_counter("upstream_failures_total", &users);
        store.increment_counter("upstream_failures_total", &users);
        store.increment_counter("upstream_failures_total", &auth);

        assert_eq!(store.counter("upstream_failures_total", &users), 2);
        assert_eq!(store.counter("upstream_failures_total", &auth), 1);
        assert_eq!(store.counter_total("upstream_failures_total"), 3);
        assert_eq!(store.counter("unknown", &[]), 0);
    }

    #[test]
    fn test_label_order_does_not_matter() {
        let store = InMemoryMetricStore::new();
        store.set_gauge(
            "registry_instances",
            &[("service", "a".to_string()), ("state", "healthy".to_string())],
            3.0,
        );
        assert_eq!(
            store.gauge(
                "registry_instances",
                &[("state", "healthy".to_string()), ("service", "a".to_string())]
            ),
            Some(3.0)
        );
    }

    #[test]
    fn test_histogram_records_values() {
        let store = InMemoryMetricStore::new();
        store.record_histogram("upstream_request_duration_seconds", &[], 0.25);
        store.record_histogram("upstream_request_duration_seconds", &[], 0.5);
        assert_eq!(store.histogram("upstream_request_duration_seconds", &[]), vec![0.25, 0.5]);
    }

    #[test]
    fn test_prometheus_store_without_recorder_is_noop() {
        let store = PrometheusMetricStore;
        store.increment_counter("gateway_requests_total", &[]);
        store.set_gauge("registry_services", &[], 1.0);
        store.record_histogram("gateway_request_duration_seconds", &[], 0.1);
    }
}
