//! # Service Registry
//!
//! Maps service names to ordered groups of instances. Each [`ServiceGroup`]
//! owns its instances, its connection counters and its rotation cursor, so
//! operations on different services never contend on the same lock.
//!
//! ## Rust Concepts Used
//!
//! - `DashMap` shards the name → group map; a shard lock is held only long
//!   enough to clone the group's `Arc`
//! - `parking_lot::RwLock` guards each group's instance list
//! - `Arc<AtomicU64>` connection counters outlive re-registration, so an
//!   in-flight lease keeps decrementing the right counter

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{InstanceRegistration, RegistryStats, ServiceInstance, ServiceSummary};
use crate::discovery::events::{BroadcastPublisher, EventPublisher, RegistryEvent};
use crate::load_balancing::{RotationCursor, StrategyKind};
use crate::observability::metrics::{MetricStore, PrometheusMetricStore};

/// Live record of one instance plus its in-flight counter
#[derive(Debug)]
struct InstanceSlot {
    instance: ServiceInstance,
    connections: Arc<AtomicU64>,
}

impl InstanceSlot {
    fn snapshot(&self) -> ServiceInstance {
        let mut snapshot = self.instance.clone();
        snapshot.connections = self.connections.load(Ordering::Relaxed);
        snapshot
    }
}

/// An instance chosen for dispatch together with its connection counter
#[derive(Debug, Clone)]
pub struct Selection {
    pub instance: ServiceInstance,
    pub connections: Arc<AtomicU64>,
}

/// All instances of one service, in registration order
#[derive(Debug, Default)]
pub struct ServiceGroup {
    slots: RwLock<Vec<InstanceSlot>>,
    cursor: RotationCursor,
}

impl ServiceGroup {
    fn new() -> Self {
        Self::default()
    }

    /// `(total, healthy)` read under one lock so the pair is consistent
    pub fn counts(&self) -> (usize, usize) {
        let slots = self.slots.read();
        let healthy = slots.iter().filter(|s| s.instance.healthy).count();
        (slots.len(), healthy)
    }

    pub fn snapshot(&self) -> Vec<ServiceInstance> {
        self.slots.read().iter().map(InstanceSlot::snapshot).collect()
    }

    pub fn cursor(&self) -> &RotationCursor {
        &self.cursor
    }

    /// Run `strategy` over the healthy instances under a single read lock
    pub fn select(&self, strategy: StrategyKind) -> Option<Selection> {
        let slots = self.slots.read();
        let (positions, candidates): (Vec<usize>, Vec<ServiceInstance>) = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.instance.healthy)
            .map(|(position, slot)| (position, slot.snapshot()))
            .unzip();

        let chosen = strategy.select(&candidates, &self.cursor)?;
        let index = candidates.iter().position(|c| std::ptr::eq(c, chosen))?;
        let slot = &slots[positions[index]];

        Some(Selection {
            instance: chosen.clone(),
            connections: slot.connections.clone(),
        })
    }

    fn set_health<F>(&self, matches: F, healthy: bool) -> Option<(String, bool)>
    where
        F: Fn(&ServiceInstance) -> bool,
    {
        let mut slots = self.slots.write();
        let slot = slots.iter_mut().find(|s| matches(&s.instance))?;
        let previous = slot.instance.healthy;
        slot.instance.healthy = healthy;
        slot.instance.last_health_check = Utc::now();
        Some((slot.instance.id.clone(), previous))
    }
}

/// Registry of named services
pub struct ServiceRegistry {
    groups: DashMap<String, Arc<ServiceGroup>>,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<dyn MetricStore>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    /// Registry publishing to a private broadcast channel and the global metrics recorder
    pub fn new() -> Self {
        Self {
            groups: DashMap::new(),
            events: Arc::new(BroadcastPublisher::default()),
            metrics: Arc::new(PrometheusMetricStore),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricStore>) -> Self {
        self.metrics = metrics;
        self
    }

    pub(crate) fn events(&self) -> &Arc<dyn EventPublisher> {
        &self.events
    }

    pub(crate) fn metrics(&self) -> &Arc<dyn MetricStore> {
        &self.metrics
    }

    fn validate(service: &str, registration: &InstanceRegistration) -> GatewayResult<()> {
        if service.trim().is_empty() {
            return Err(GatewayError::malformed("serviceName", "is required"));
        }
        if registration.id.trim().is_empty() {
            return Err(GatewayError::malformed("instance.id", "is required"));
        }
        if registration.url.trim().is_empty() {
            return Err(GatewayError::malformed("instance.url", "is required"));
        }
        Url::parse(&registration.url)
            .map_err(|e| GatewayError::malformed("instance.url", format!("is not a valid url: {}", e)))?;
        if registration.weight == Some(0) {
            return Err(GatewayError::malformed("instance.weight", "must be positive"));
        }
        Ok(())
    }

    /// Insert or update an instance, keyed by id within the service
    ///
    /// Re-registration keeps `registered_at` and the in-flight counter; fields
    /// left out of the registration keep their current values.
    pub fn register(&self, service: &str, registration: InstanceRegistration) -> GatewayResult<ServiceInstance> {
        Self::validate(service, &registration)?;

        let group = self
            .groups
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(ServiceGroup::new()))
            .clone();

        let (snapshot, existed) = {
            let mut slots = group.slots.write();
            match slots.iter_mut().find(|s| s.instance.id == registration.id) {
                Some(slot) => {
                    let instance = &mut slot.instance;
                    instance.url = registration.url;
                    if let Some(weight) = registration.weight {
                        instance.weight = weight;
                    }
                    if let Some(healthy) = registration.healthy {
                        instance.healthy = healthy;
                        instance.last_health_check = Utc::now();
                    }
                    instance.metadata.extend(registration.metadata);
                    (slot.snapshot(), true)
                }
                None => {
                    let mut instance = ServiceInstance::new(registration.id, registration.url);
                    if let Some(weight) = registration.weight {
                        instance.weight = weight;
                    }
                    if let Some(healthy) = registration.healthy {
                        instance.healthy = healthy;
                    }
                    instance.metadata = registration.metadata;
                    let slot = InstanceSlot {
                        instance,
                        connections: Arc::new(AtomicU64::new(0)),
                    };
                    let snapshot = slot.snapshot();
                    slots.push(slot);
                    (snapshot, false)
                }
            }
        };

        let labels = [("service", service.to_string())];
        if existed {
            debug!(service = %service, instance_id = %snapshot.id, "Updated service instance");
            self.events.publish(RegistryEvent::Updated {
                service: service.to_string(),
                instance: snapshot.clone(),
            });
        } else {
            info!(
                service = %service,
                instance_id = %snapshot.id,
                url = %snapshot.url,
                "📝 Registered service instance"
            );
            self.metrics.increment_counter("registry_registrations_total", &labels);
            self.events.publish(RegistryEvent::Registered {
                service: service.to_string(),
                instance: snapshot.clone(),
            });
        }
        self.record_group_gauges(service, &group);

        Ok(snapshot)
    }

    /// Remove an instance; the group stays behind even when emptied
    pub fn deregister(&self, service: &str, instance_id: &str) -> bool {
        let Some(group) = self.group(service) else {
            return false;
        };

        let removed = {
            let mut slots = group.slots.write();
            let before = slots.len();
            slots.retain(|s| s.instance.id != instance_id);
            slots.len() != before
        };

        if removed {
            info!(service = %service, instance_id = %instance_id, "🗑️ Deregistered service instance");
            self.metrics
                .increment_counter("registry_deregistrations_total", &[("service", service.to_string())]);
            self.events.publish(RegistryEvent::Deregistered {
                service: service.to_string(),
                instance_id: instance_id.to_string(),
            });
            self.record_group_gauges(service, &group);
        }

        removed
    }

    /// Snapshot of a service's instances; empty for unknown services
    pub fn list(&self, service: &str) -> Vec<ServiceInstance> {
        self.group(service).map(|g| g.snapshot()).unwrap_or_default()
    }

    /// Snapshot of every service with totals
    pub fn list_all(&self) -> HashMap<String, ServiceSummary> {
        self.groups
            .iter()
            .map(|entry| {
                let instances = entry.value().snapshot();
                let healthy_count = instances.iter().filter(|i| i.healthy).count();
                (
                    entry.key().clone(),
                    ServiceSummary {
                        total: instances.len(),
                        healthy_count,
                        instances,
                    },
                )
            })
            .collect()
    }

    /// Whether the service has ever been registered (an emptied group still counts)
    pub fn contains(&self, service: &str) -> bool {
        self.groups.contains_key(service)
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn group(&self, service: &str) -> Option<Arc<ServiceGroup>> {
        self.groups.get(service).map(|g| g.value().clone())
    }

    pub fn find_by_url(&self, service: &str, url: &str) -> Option<ServiceInstance> {
        let wanted = url.trim_end_matches('/');
        self.list(service)
            .into_iter()
            .find(|i| i.url.trim_end_matches('/') == wanted)
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in self.groups.iter() {
            let slots = entry.value().slots.read();
            let healthy = slots.iter().filter(|s| s.instance.healthy).count();
            stats.total_services += 1;
            stats.total_instances += slots.len();
            stats.healthy_instances += healthy;
            stats.unhealthy_instances += slots.len().saturating_sub(healthy);
        }
        stats
    }

    /// Flip health by instance id; returns the previous value when the instance exists
    pub(crate) fn set_health(&self, service: &str, instance_id: &str, healthy: bool) -> Option<bool> {
        let group = self.group(service)?;
        let (_, previous) = group.set_health(|i| i.id == instance_id, healthy)?;
        self.record_group_gauges(service, &group);
        Some(previous)
    }

    /// Flip health by instance url; returns the instance id and previous value
    pub(crate) fn set_health_by_url(&self, service: &str, url: &str, healthy: bool) -> Option<(String, bool)> {
        let group = self.group(service)?;
        let wanted = url.trim_end_matches('/');
        let result = group.set_health(|i| i.url.trim_end_matches('/') == wanted, healthy)?;
        self.record_group_gauges(service, &group);
        Some(result)
    }

    fn record_group_gauges(&self, service: &str, group: &ServiceGroup) {
        let (total, healthy) = group.counts();
        self.metrics.set_gauge(
            "registry_instances",
            &[("service", service.to_string()), ("state", "healthy".to_string())],
            healthy as f64,
        );
        self.metrics.set_gauge(
            "registry_instances",
            &[("service", service.to_string()), ("state", "unhealthy".to_string())],
            total.saturating_sub(healthy) as f64,
        );
    }
}
