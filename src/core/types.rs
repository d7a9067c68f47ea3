//! # Core Types Module
//!
//! Data structures shared by the registry, the balancer and the HTTP layer.
//!
//! [`ServiceInstance`] is the *snapshot* shape: it is what `list`, `resolve`
//! and the JSON API hand out. The live record behind it is owned by the
//! registry group of its service and is only mutated through registry and
//! health-tracker operations, so a snapshot never changes under a reader.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default selection weight for instances that do not specify one
pub const DEFAULT_WEIGHT: u32 = 1;

/// One running endpoint of a named service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    /// Identifier, unique within its service
    pub id: String,

    /// Base URL requests are forwarded to (e.g. `http://localhost:8201`)
    pub url: String,

    /// Relative weight for weighted selection, always positive
    pub weight: u32,

    /// Result of the last health report; unknown counts as healthy
    pub healthy: bool,

    /// In-flight dispatches at snapshot time
    pub connections: u64,

    pub registered_at: DateTime<Utc>,

    pub last_health_check: DateTime<Utc>,

    /// Free-form labels supplied at registration
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    /// Create a fresh instance record stamped with the current time
    pub fn new<I: Into<String>, U: Into<String>>(id: I, url: U) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            url: url.into(),
            weight: DEFAULT_WEIGHT,
            healthy: true,
            connections: 0,
            registered_at: now,
            last_health_check: now,
            metadata: HashMap::new(),
        }
    }
}

/// Registration payload for a single instance
///
/// Optional fields follow merge semantics on upsert: a field left out keeps
/// whatever the existing record holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRegistration {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthy: Option<bool>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl InstanceRegistration {
    pub fn new<I: Into<String>, U: Into<String>>(id: I, url: U) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_health(mut self, healthy: bool) -> Self {
        self.healthy = Some(healthy);
        self
    }
}

/// Per-service view returned by `list_all`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSummary {
    pub total: usize,
    pub healthy_count: usize,
    pub instances: Vec<ServiceInstance>,
}

/// Registry-wide counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_services: usize,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
}
