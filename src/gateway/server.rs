//! # HTTP Server Module
//!
//! Builds the gateway's components from configuration and serves them with axum.
//!
//! ## Router layout
//! - Control-plane routes, throttled under the control-plane limit class
//! - `GET /health` and the metrics endpoint, never throttled
//! - Everything else falls through to the upstream proxy, throttled under the
//!   matching route's class or the default class
//!
//! The whole tree sits behind `TraceLayer` for access spans.

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header, StatusCode},
    middleware::from_fn_with_state,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::core::config::GatewayConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::discovery::{BroadcastPublisher, Discovery, HealthProber, ServiceRegistry};
use crate::gateway::control_plane::{ControlPlaneRouter, ControlPlaneState};
use crate::gateway::proxy::{proxy_handler, DispatchTimeouts, UpstreamProxy};
use crate::gateway::routes::RouteTable;
use crate::load_balancing::StrategyKind;
use crate::middleware::{rate_limit, LimitScope, RateLimitState, RateLimiter};
use crate::observability::metrics::MetricsExporter;
use crate::storage::KeyValueStore;

/// Everything the HTTP surface needs, built once at startup
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<ServiceRegistry>,
    events: Arc<BroadcastPublisher>,
    discovery: Discovery,
    routes: Arc<RouteTable>,
    limiter: Option<Arc<RateLimiter>>,
    exporter: Option<MetricsExporter>,
}

impl Gateway {
    /// Assemble registry, discovery, routes and limiter; seeds the registry from config
    ///
    /// `store` backs the rate windows and is unused when rate limiting is disabled.
    pub fn build(config: GatewayConfig, store: Arc<dyn KeyValueStore>) -> GatewayResult<Self> {
        let events = Arc::new(BroadcastPublisher::new(config.discovery.event_buffer));
        let registry = Arc::new(ServiceRegistry::new().with_events(events.clone()));

        for (service, instances) in &config.discovery.seed {
            for registration in instances {
                registry.register(service, registration.clone())?;
            }
            info!(service = %service, instances = instances.len(), "Seeded service from configuration");
        }

        let service_strategies: HashMap<String, StrategyKind> = config
            .upstream
            .services
            .iter()
            .filter_map(|(name, settings)| {
                settings
                    .strategy
                    .as_deref()
                    .map(|s| (name.clone(), StrategyKind::from_name(s)))
            })
            .collect();

        let discovery = Discovery::new(registry.clone())
            .with_default_strategy(StrategyKind::from_name(&config.discovery.default_strategy))
            .with_service_strategies(service_strategies)
            .with_hostnames(config.discovery.hostnames.clone());

        let routes = Arc::new(RouteTable::from_config(
            &config.routes,
            config.discovery.default_service.clone(),
        )?);

        let limiter = if config.rate_limiting.enabled {
            Some(Arc::new(RateLimiter::from_config(&config.rate_limiting, store)?))
        } else {
            None
        };

        Ok(Self {
            config,
            registry,
            events,
            discovery,
            routes,
            limiter,
            exporter: None,
        })
    }

    /// Serve Prometheus text at the configured metrics path
    pub fn with_metrics_exporter(mut self, exporter: MetricsExporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<BroadcastPublisher> {
        &self.events
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    /// Build the complete axum application
    pub fn router(&self) -> GatewayResult<Router> {
        let proxy = Arc::new(UpstreamProxy::new(
            self.discovery.clone(),
            self.routes.clone(),
            DispatchTimeouts::from_config(&self.config),
            self.config.server.max_request_size,
        )?);

        let mut control = ControlPlaneRouter::create_router(ControlPlaneState {
            discovery: self.discovery.clone(),
        });
        let mut data = Router::new().fallback(proxy_handler).with_state(proxy);

        if let Some(limiter) = &self.limiter {
            let admin_scope = RateLimitState::new(
                limiter.clone(),
                LimitScope::Fixed(self.config.rate_limiting.control_plane_class.clone()),
            );
            let routed_scope = RateLimitState::new(
                limiter.clone(),
                LimitScope::Routed {
                    routes: self.routes.clone(),
                    default_class: self.config.rate_limiting.default_class.clone(),
                },
            );
            control = control.route_layer(from_fn_with_state(admin_scope, rate_limit));
            data = data.layer(from_fn_with_state(routed_scope, rate_limit));
        }

        let ops_state = OpsState {
            discovery: self.discovery.clone(),
            limiter: self.limiter.clone(),
            exporter: self.exporter.clone(),
        };
        let mut ops = Router::new().route("/health", get(gateway_health));
        if self.config.observability.metrics.prometheus_enabled && self.exporter.is_some() {
            ops = ops.route(&self.config.observability.metrics.endpoint_path, get(render_metrics));
        }

        Ok(control
            .merge(ops.with_state(ops_state))
            .merge(data)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(DefaultBodyLimit::max(self.config.server.max_request_size)),
            ))
    }

    /// Start the active health prober when enabled
    pub fn spawn_prober(&self, token: CancellationToken) -> GatewayResult<Option<JoinHandle<()>>> {
        if !self.config.discovery.health_check.enabled {
            debug!("Active health probing disabled");
            return Ok(None);
        }
        let prober = Arc::new(HealthProber::new(
            self.registry.clone(),
            self.config.discovery.health_check.clone(),
        )?);
        Ok(Some(prober.spawn(token)))
    }

    /// Log every registry event until `token` is cancelled
    pub fn spawn_event_log(&self, token: CancellationToken) -> JoinHandle<()> {
        let mut subscription = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = subscription.next() => event,
                };
                match event {
                    Some(event) => info!(
                        event = event.kind(),
                        service = %event.service(),
                        details = %serde_json::to_string(&event).unwrap_or_default(),
                        "Registry event"
                    ),
                    None => break,
                }
            }
        })
    }

    /// Serve on `listener` until `shutdown` is cancelled
    ///
    /// In-flight requests get `server.shutdown_timeout` to finish after cancellation.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> GatewayResult<()> {
        let app = self.router()?;
        let local_addr = listener.local_addr()?;
        let grace = self.config.server.shutdown_timeout;

        info!(address = %local_addr, "🌐 Gateway listening");

        let graceful = shutdown.clone();
        let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move { graceful.cancelled().await });

        let deadline = async move {
            shutdown.cancelled().await;
            tokio::time::sleep(grace).await;
        };

        tokio::select! {
            result = server => {
                result.map_err(|e| GatewayError::internal(format!("Gateway server error: {}", e)))?;
            }
            _ = deadline => {
                warn!(timeout = ?grace, "Shutdown timeout elapsed, dropping open connections");
            }
        }

        Ok(())
    }
}

#[derive(Clone)]
struct OpsState {
    discovery: Discovery,
    limiter: Option<Arc<RateLimiter>>,
    exporter: Option<MetricsExporter>,
}

/// Gateway liveness plus registry totals
async fn gateway_health(State(state): State<OpsState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now(),
        "rateLimitStore": state.limiter.as_ref().map(|l| l.store_backend()),
        "stats": state.discovery.registry().stats(),
    }))
}

async fn render_metrics(State(state): State<OpsState>) -> Response {
    match &state.exporter {
        Some(exporter) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            exporter.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
