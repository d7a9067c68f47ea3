//! # Health Tracker
//!
//! Applies health reports to registry instances. Reports are idempotent and
//! never fail the caller: a report for an unknown service or instance is
//! logged and dropped.

use std::sync::Arc;
use tracing::{info, warn};

use crate::core::types::ServiceInstance;
use crate::discovery::events::RegistryEvent;
use crate::discovery::registry::ServiceRegistry;

/// Outcome of a health report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthUpdate {
    /// The instance's health flipped
    Changed,
    /// The instance already had this health; only the check time moved
    Unchanged,
    /// No such instance
    Ignored,
}

#[derive(Clone)]
pub struct HealthTracker {
    registry: Arc<ServiceRegistry>,
}

impl HealthTracker {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }

    /// Record the health of an instance addressed by id
    pub fn report(&self, service: &str, instance_id: &str, healthy: bool) -> HealthUpdate {
        match self.registry.set_health(service, instance_id, healthy) {
            Some(previous) => self.after_update(service, instance_id, previous, healthy),
            None => {
                warn!(
                    service = %service,
                    instance_id = %instance_id,
                    healthy,
                    "Health report for unknown instance ignored"
                );
                HealthUpdate::Ignored
            }
        }
    }

    /// Record the health of an instance addressed by its base url
    pub fn report_by_url(&self, service: &str, url: &str, healthy: bool) -> HealthUpdate {
        match self.registry.set_health_by_url(service, url, healthy) {
            Some((instance_id, previous)) => self.after_update(service, &instance_id, previous, healthy),
            None => {
                warn!(service = %service, url = %url, healthy, "Health report for unknown url ignored");
                HealthUpdate::Ignored
            }
        }
    }

    /// Eligibility predicate used by selection; instances start out healthy
    pub fn is_healthy(instance: &ServiceInstance) -> bool {
        instance.healthy
    }

    fn after_update(&self, service: &str, instance_id: &str, previous: bool, healthy: bool) -> HealthUpdate {
        if previous == healthy {
            return HealthUpdate::Unchanged;
        }

        let state = if healthy { "healthy" } else { "unhealthy" };
        info!(
            service = %service,
            instance_id = %instance_id,
            state,
            "🏥 Instance health changed"
        );

        self.registry.metrics().increment_counter(
            "health_transitions_total",
            &[("service", service.to_string()), ("state", state.to_string())],
        );
        self.registry.events().publish(RegistryEvent::HealthChanged {
            service: service.to_string(),
            instance_id: instance_id.to_string(),
            healthy,
        });

        HealthUpdate::Changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::InstanceRegistration;
    use crate::discovery::events::BroadcastPublisher;
    use crate::observability::metrics::InMemoryMetricStore;

    fn setup() -> (Arc<ServiceRegistry>, HealthTracker, Arc<BroadcastPublisher>, Arc<InMemoryMetricStore>) {
        let publisher = Arc::new(BroadcastPublisher::new(16));
        let metrics = Arc::new(InMemoryMetricStore::new());
        let registry = Arc::new(
            ServiceRegistry::new()
                .with_events(publisher.clone())
                .with_metrics(metrics.clone()),
        );
        registry
            .register("user-service", InstanceRegistration::new("u1", "http://localhost:8201"))
            .unwrap();
        let tracker = HealthTracker::new(registry.clone());
        (registry, tracker, publisher, metrics)
    }

    #[tokio::test]
    async fn test_report_flips_health_and_publishes() {
        let (registry, tracker, publisher, metrics) = setup();
        let mut events = publisher.subscribe();
        let before = registry.list("user-service")[0].last_health_check;

        assert_eq!(tracker.report("user-service", "u1", false), HealthUpdate::Changed);

        let instance = &registry.list("user-service")[0];
        assert!(!HealthTracker::is_healthy(instance));
        assert!(instance.last_health_check >= before);
        assert_eq!(
            events.next().await,
            Some(RegistryEvent::HealthChanged {
                service: "user-service".to_string(),
                instance_id: "u1".to_string(),
                healthy: false,
            })
        );
        assert_eq!(
            metrics.counter(
                "health_transitions_total",
                &[("service", "user-service".to_string()), ("state", "unhealthy".to_string())]
            ),
            1
        );
    }

    #[test]
    fn test_report_is_idempotent() {
        let (_, tracker, _, metrics) = setup();
        assert_eq!(tracker.report("user-service", "u1", false), HealthUpdate::Changed);
        assert_eq!(tracker.report("user-service", "u1", false), HealthUpdate::Unchanged);
        assert_eq!(metrics.counter_total("health_transitions_total"), 1);
    }

    #[test]
    fn test_unknown_targets_are_ignored() {
        let (_, tracker, _, _) = setup();
        assert_eq!(tracker.report("user-service", "missing", false), HealthUpdate::Ignored);
        assert_eq!(tracker.report("missing", "u1", false), HealthUpdate::Ignored);
        assert_eq!(
            tracker.report_by_url("user-service", "http://localhost:1", false),
            HealthUpdate::Ignored
        );
    }

    #[test]
    fn test_report_by_url() {
        let (registry, tracker, _, _) = setup();
        assert_eq!(
            tracker.report_by_url("user-service", "http://localhost:8201", false),
            HealthUpdate::Changed
        );
        assert!(!registry.list("user-service")[0].healthy);
        assert_eq!(
            tracker.report_by_url("user-service", "http://localhost:8201/", true),
            HealthUpdate::Changed
        );
        assert!(registry.list("user-service")[0].healthy);
    }
}
