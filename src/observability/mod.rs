// Structured logging
pub mod logging;

// Metrics capability and Prometheus export
pub mod metrics;

pub use logging::init_logging;
pub use metrics::{InMemoryMetricStore, MetricStore, MetricsExporter, PrometheusMetricStore};
