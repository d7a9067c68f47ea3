//! # Discovery Façade
//!
//! "Give me an instance of X": registry lookup, health filter and strategy in
//! one call. [`Discovery::checkout`] additionally hands out a [`Lease`] whose
//! guard holds the instance's in-flight counter up until it is dropped, which
//! is how the router accounts for connections even when a request is cancelled.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::ServiceInstance;
use crate::discovery::health::HealthTracker;
use crate::discovery::registry::{Selection, ServiceRegistry};
use crate::load_balancing::StrategyKind;

/// TTL advertised for hostname resolutions, in seconds
pub const RESOLUTION_TTL_SECS: u32 = 300;

/// Decrements an instance's in-flight counter when dropped
#[derive(Debug)]
pub struct ConnectionGuard {
    counter: Arc<AtomicU64>,
}

impl ConnectionGuard {
    fn acquire(counter: Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }

    /// In-flight count including this guard
    pub fn in_flight(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        // Saturating so a counter can never wrap below zero
        let _ = self
            .counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }
}

/// An instance checked out for one dispatch
#[derive(Debug)]
pub struct Lease {
    pub service: String,
    pub instance: ServiceInstance,
    guard: ConnectionGuard,
}

impl Lease {
    /// Split into the instance snapshot and the guard that must outlive the dispatch
    pub fn into_parts(self) -> (ServiceInstance, ConnectionGuard) {
        (self.instance, self.guard)
    }

    pub fn in_flight(&self) -> u64 {
        self.guard.in_flight()
    }
}

/// Answer for `/resolve/:hostname`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostResolution {
    pub hostname: String,
    pub ip: String,
    pub ttl: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

/// Registry + health filter + strategy
#[derive(Clone)]
pub struct Discovery {
    registry: Arc<ServiceRegistry>,
    health: HealthTracker,
    hostnames: Arc<HashMap<String, String>>,
    default_strategy: StrategyKind,
    service_strategies: Arc<HashMap<String, StrategyKind>>,
}

impl Discovery {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            health: HealthTracker::new(registry.clone()),
            registry,
            hostnames: Arc::new(HashMap::new()),
            default_strategy: StrategyKind::RoundRobin,
            service_strategies: Arc::new(HashMap::new()),
        }
    }

    /// Hostname → service table consulted before system DNS
    pub fn with_hostnames(mut self, hostnames: HashMap<String, String>) -> Self {
        self.hostnames = Arc::new(hostnames);
        self
    }

    pub fn with_default_strategy(mut self, strategy: StrategyKind) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Per-service strategies used when a caller does not pick one
    pub fn with_service_strategies(mut self, strategies: HashMap<String, StrategyKind>) -> Self {
        self.service_strategies = Arc::new(strategies);
        self
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    /// Strategy for a service: explicit request, then service setting, then default
    pub fn strategy_for(&self, service: &str, requested: Option<&str>) -> StrategyKind {
        match requested {
            Some(name) => StrategyKind::from_name(name),
            None => self
                .service_strategies
                .get(service)
                .copied()
                .unwrap_or(self.default_strategy),
        }
    }

    /// Pick an instance of `service`
    ///
    /// `UnknownService` when the name was never registered, `NoHealthyInstance`
    /// when the group exists but nothing in it is eligible.
    pub fn resolve(&self, service: &str, strategy: StrategyKind) -> GatewayResult<ServiceInstance> {
        self.select(service, strategy).map(|selection| selection.instance)
    }

    /// Pick an instance and hold its in-flight counter until the lease drops
    pub fn checkout(&self, service: &str, strategy: StrategyKind) -> GatewayResult<Lease> {
        let selection = self.select(service, strategy)?;
        let guard = ConnectionGuard::acquire(selection.connections);
        let mut instance = selection.instance;
        instance.connections = guard.in_flight();

        Ok(Lease {
            service: service.to_string(),
            instance,
            guard,
        })
    }

    fn select(&self, service: &str, strategy: StrategyKind) -> GatewayResult<Selection> {
        let group = self
            .registry
            .group(service)
            .ok_or_else(|| GatewayError::unknown_service(service))?;

        let selection = group
            .select(strategy)
            .ok_or_else(|| GatewayError::no_healthy_instance(service))?;

        debug!(
            service = %service,
            instance_id = %selection.instance.id,
            strategy = %strategy,
            "Resolved service instance"
        );
        Ok(selection)
    }

    /// Resolve a hostname through the configured table, falling back to system DNS
    pub async fn resolve_hostname(&self, hostname: &str) -> GatewayResult<HostResolution> {
        if let Some(service) = self.hostnames.get(hostname) {
            let instance = self.resolve(service, self.strategy_for(service, None))?;
            return Ok(HostResolution {
                hostname: hostname.to_string(),
                ip: instance.url,
                ttl: RESOLUTION_TTL_SECS,
                service: Some(service.clone()),
            });
        }

        let mut addresses = tokio::net::lookup_host((hostname, 0))
            .await
            .map_err(|_| GatewayError::HostnameNotFound {
                hostname: hostname.to_string(),
            })?;

        let address = addresses.next().ok_or_else(|| GatewayError::HostnameNotFound {
            hostname: hostname.to_string(),
        })?;

        Ok(HostResolution {
            hostname: hostname.to_string(),
            ip: address.ip().to_string(),
            ttl: RESOLUTION_TTL_SECS,
            service: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::InstanceRegistration;

    fn discovery() -> Discovery {
        let registry = Arc::new(ServiceRegistry::new());
        registry
            .register("user-service", InstanceRegistration::new("u1", "http://localhost:8201"))
            .unwrap();
        registry
            .register("user-service", InstanceRegistration::new("u2", "http://localhost:8202"))
            .unwrap();
        Discovery::new(registry)
    }

    #[test]
    fn test_resolve_unknown_vs_no_healthy() {
        let discovery = discovery();
        assert!(matches!(
            discovery.resolve("billing", StrategyKind::RoundRobin),
            Err(GatewayError::UnknownService { .. })
        ));

        discovery.health().report("user-service", "u1", false);
        discovery.health().report("user-service", "u2", false);
        assert!(matches!(
            discovery.resolve("user-service", StrategyKind::RoundRobin),
            Err(GatewayError::NoHealthyInstance { .. })
        ));
    }

    #[test]
    fn test_resolve_after_group_emptied() {
        let discovery = discovery();
        discovery.registry().deregister("user-service", "u1");
        discovery.registry().deregister("user-service", "u2");
        assert!(matches!(
            discovery.resolve("user-service", StrategyKind::Random),
            Err(GatewayError::NoHealthyInstance { .. })
        ));
    }

    #[test]
    fn test_lease_holds_and_releases_counter() {
        let discovery = discovery();
        let lease = discovery.checkout("user-service", StrategyKind::FirstHealthy).unwrap();
        assert_eq!(lease.instance.id, "u1");
        assert_eq!(lease.in_flight(), 1);
        assert_eq!(discovery.registry().list("user-service")[0].connections, 1);

        // Least-connections now prefers the idle instance
        let other = discovery.resolve("user-service", StrategyKind::LeastConnections).unwrap();
        assert_eq!(other.id, "u2");

        drop(lease);
        assert_eq!(discovery.registry().list("user-service")[0].connections, 0);
    }

    #[test]
    fn test_strategy_precedence() {
        let mut per_service = HashMap::new();
        per_service.insert("user-service".to_string(), StrategyKind::LeastConnections);
        let discovery = discovery()
            .with_default_strategy(StrategyKind::Random)
            .with_service_strategies(per_service);

        assert_eq!(discovery.strategy_for("user-service", None), StrategyKind::LeastConnections);
        assert_eq!(discovery.strategy_for("auth-service", None), StrategyKind::Random);
        assert_eq!(
            discovery.strategy_for("user-service", Some("round-robin")),
            StrategyKind::RoundRobin
        );
        assert_eq!(discovery.strategy_for("user-service", Some("bogus")), StrategyKind::FirstHealthy);
    }

    #[tokio::test]
    async fn test_resolve_hostname_through_table() {
        let mut hostnames = HashMap::new();
        hostnames.insert("users.example.internal".to_string(), "user-service".to_string());
        let discovery = discovery().with_hostnames(hostnames);

        let resolution = discovery.resolve_hostname("users.example.internal").await.unwrap();
        assert_eq!(resolution.ip, "http://localhost:8201");
        assert_eq!(resolution.ttl, RESOLUTION_TTL_SECS);
        assert_eq!(resolution.service.as_deref(), Some("user-service"));
    }

    #[tokio::test]
    async fn test_resolve_hostname_falls_back_to_system() {
        let discovery = discovery();
        let resolution = discovery.resolve_hostname("localhost").await.unwrap();
        assert!(resolution.service.is_none());
        assert!(!resolution.ip.is_empty());
    }
}
