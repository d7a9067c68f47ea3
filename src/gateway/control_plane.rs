//! # Control-Plane API
//!
//! JSON endpoints for registering instances, reporting health and asking for
//! an instance of a service. Errors render through [`GatewayError`]'s
//! `IntoResponse`, so every failure uses the same envelope.
//!
//! Request bodies are parsed by hand rather than with the `Json` extractor so
//! that a missing field is a 400 in the gateway's own error format.

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::InstanceRegistration;
use crate::discovery::Discovery;

#[derive(Clone)]
pub struct ControlPlaneState {
    pub discovery: Discovery,
}

pub struct ControlPlaneRouter;

impl ControlPlaneRouter {
    pub fn create_router(state: ControlPlaneState) -> Router {
        Router::new()
            .route("/register", post(register_instance))
            .route("/deregister/:service_name/:instance_id", delete(deregister_instance))
            .route("/discover/:service_name", get(discover_instance))
            .route("/health/:service_name/:instance_id", post(report_health))
            .route("/services", get(list_services))
            .route("/resolve/:hostname", get(resolve_hostname))
            .route("/lb/health/:service_name/:url", post(report_server_health))
            .route("/lb/stats", get(balancer_stats))
            .with_state(state)
    }
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> GatewayResult<T> {
    if body.is_empty() {
        return Err(GatewayError::malformed("body", "is required"));
    }
    serde_json::from_slice(body).map_err(|e| GatewayError::malformed("body", e.to_string()))
}

/// Instance fields as sent by callers; every field is optional so that
/// missing ones can be reported by name
#[derive(Debug, Default, Deserialize)]
struct RawInstance {
    id: Option<String>,
    url: Option<String>,
    weight: Option<u32>,
    healthy: Option<bool>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    service_name: Option<String>,
    instance: Option<RawInstance>,
}

impl RegisterRequest {
    fn into_registration(self) -> GatewayResult<(String, InstanceRegistration)> {
        let service = self
            .service_name
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| GatewayError::malformed("serviceName", "is required"))?;
        let raw = self
            .instance
            .ok_or_else(|| GatewayError::malformed("instance", "is required"))?;
        let id = raw
            .id
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| GatewayError::malformed("instance.id", "is required"))?;
        let url = raw
            .url
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| GatewayError::malformed("instance.url", "is required"))?;

        let mut registration = InstanceRegistration::new(id, url);
        registration.weight = raw.weight;
        registration.healthy = raw.healthy;
        registration.metadata = raw.metadata;
        Ok((service, registration))
    }
}

#[derive(Debug, Deserialize)]
struct HealthReportRequest {
    healthy: Option<bool>,
}

impl HealthReportRequest {
    fn healthy(self) -> GatewayResult<bool> {
        self.healthy
            .ok_or_else(|| GatewayError::malformed("healthy", "is required"))
    }
}

#[derive(Debug, Deserialize)]
struct DiscoverQuery {
    strategy: Option<String>,
}

/// Totals per service, as reported by `/lb/stats`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalancerServiceStats {
    pub total: usize,
    pub healthy: usize,
}

fn service_stats(discovery: &Discovery) -> BTreeMap<String, BalancerServiceStats> {
    discovery
        .registry()
        .list_all()
        .into_iter()
        .map(|(name, summary)| {
            (
                name,
                BalancerServiceStats {
                    total: summary.total,
                    healthy: summary.healthy_count,
                },
            )
        })
        .collect()
}

async fn register_instance(State(state): State<ControlPlaneState>, body: Bytes) -> GatewayResult<Json<Value>> {
    let request: RegisterRequest = parse_body(&body)?;
    let (service, registration) = request.into_registration()?;
    let instance = state.discovery.registry().register(&service, registration)?;

    Ok(Json(json!({
        "message": "Service registered successfully",
        "instance": instance,
    })))
}

async fn deregister_instance(
    State(state): State<ControlPlaneState>,
    Path((service_name, instance_id)): Path<(String, String)>,
) -> GatewayResult<Json<Value>> {
    if !state.discovery.registry().deregister(&service_name, &instance_id) {
        return Err(GatewayError::instance_not_found(service_name, instance_id));
    }
    Ok(Json(json!({ "message": "Service deregistered successfully" })))
}

async fn discover_instance(
    State(state): State<ControlPlaneState>,
    Path(service_name): Path<String>,
    Query(query): Query<DiscoverQuery>,
) -> GatewayResult<Json<Value>> {
    let strategy = state
        .discovery
        .strategy_for(&service_name, query.strategy.as_deref());
    let instance = state.discovery.resolve(&service_name, strategy)?;
    Ok(Json(json!({ "instance": instance })))
}

/// Health reports for unknown instances are acknowledged and ignored
async fn report_health(
    State(state): State<ControlPlaneState>,
    Path((service_name, instance_id)): Path<(String, String)>,
    body: Bytes,
) -> GatewayResult<Json<Value>> {
    let healthy = parse_body::<HealthReportRequest>(&body)?.healthy()?;
    state.discovery.health().report(&service_name, &instance_id, healthy);
    Ok(Json(json!({ "message": "Health status updated" })))
}

async fn list_services(State(state): State<ControlPlaneState>) -> Json<Value> {
    Json(json!({ "services": state.discovery.registry().list_all() }))
}

async fn resolve_hostname(
    State(state): State<ControlPlaneState>,
    Path(hostname): Path<String>,
) -> GatewayResult<Json<Value>> {
    let resolution = state.discovery.resolve_hostname(&hostname).await?;
    Ok(Json(serde_json::to_value(resolution)?))
}

/// Health report addressed by instance url (percent-encoded in the path)
async fn report_server_health(
    State(state): State<ControlPlaneState>,
    Path((service_name, url)): Path<(String, String)>,
    body: Bytes,
) -> GatewayResult<Json<Value>> {
    let healthy = parse_body::<HealthReportRequest>(&body)?.healthy()?;
    state.discovery.health().report_by_url(&service_name, &url, healthy);
    Ok(Json(json!({
        "message": "Server health updated",
        "stats": service_stats(&state.discovery),
    })))
}

async fn balancer_stats(State(state): State<ControlPlaneState>) -> Json<Value> {
    Json(json!(service_stats(&state.discovery)))
}
