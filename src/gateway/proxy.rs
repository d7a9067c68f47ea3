//! # Upstream Proxy
//!
//! Forwards data-plane requests to a service instance picked by [`Discovery`].
//!
//! ## Request lifecycle
//! 1. Route lookup: path → service, forward path, strategy, timeout
//! 2. Checkout: an instance plus a connection lease
//! 3. Dispatch: method, filtered headers, body and query, bounded by the timeout
//! 4. Response: status, headers and a streamed body; the lease travels with the
//!    body stream and is released when the client finishes or goes away
//!
//! The dispatch timeout bounds the wait for response headers and then, again,
//! the wait for each body chunk. A transport failure or timeout demotes the chosen instance and answers 503
//! with a generic message. There is no retry. Application errors (any status
//! the instance actually returned) pass through untouched.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use http_body_util::LengthLimitError;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::core::config::GatewayConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::discovery::{ConnectionGuard, Discovery};
use crate::gateway::routes::{RouteMatch, RouteTable};
use crate::middleware::client_identifier;
use crate::observability::logging::{new_request_id, REQUEST_ID_HEADER};
use crate::observability::metrics::{MetricStore, PrometheusMetricStore};

pub const UPSTREAM_INSTANCE_HEADER: &str = "x-upstream-instance";
const FORWARDED_FOR: &str = "x-forwarded-for";
const FORWARDED_HOST: &str = "x-forwarded-host";

/// Connection-scoped headers that are never forwarded in either direction
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name)
}

/// Oversized bodies become 413; anything else failing mid-read is a 400
fn body_read_error(err: axum::Error, limit: usize) -> GatewayError {
    let inner = err.into_inner();
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&*inner);
    while let Some(cause) = source {
        if cause.is::<LengthLimitError>() {
            return GatewayError::PayloadTooLarge { limit };
        }
        source = cause.source();
    }
    GatewayError::malformed("body", format!("could not be read: {}", inner))
}

/// Dispatch timeouts: route, then service, then the default
#[derive(Debug, Clone)]
pub struct DispatchTimeouts {
    pub default: Duration,
    pub per_service: HashMap<String, Duration>,
}

impl DispatchTimeouts {
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            per_service: HashMap::new(),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        let per_service = config
            .upstream
            .services
            .iter()
            .filter_map(|(name, settings)| settings.timeout.map(|t| (name.clone(), t)))
            .collect();
        Self {
            default: config.upstream.default_timeout,
            per_service,
        }
    }

    pub fn for_route(&self, route: &RouteMatch) -> Duration {
        route
            .timeout
            .or_else(|| self.per_service.get(&route.service).copied())
            .unwrap_or(self.default)
    }
}

/// Data-plane proxy shared by every forwarded request
pub struct UpstreamProxy {
    discovery: Discovery,
    routes: Arc<RouteTable>,
    client: reqwest::Client,
    timeouts: DispatchTimeouts,
    max_body_size: usize,
    metrics: Arc<dyn MetricStore>,
}

impl UpstreamProxy {
    pub fn new(
        discovery: Discovery,
        routes: Arc<RouteTable>,
        timeouts: DispatchTimeouts,
        max_body_size: usize,
    ) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            discovery,
            routes,
            client,
            timeouts,
            max_body_size,
            metrics: Arc::new(PrometheusMetricStore),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricStore>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// Forward one request and build the client response
    pub async fn forward(&self, request: Request) -> GatewayResult<Response> {
        let path = request.uri().path().to_string();
        let route = self
            .routes
            .lookup(&path)
            .ok_or_else(|| GatewayError::unknown_service(path.clone()))?;

        let strategy = route
            .strategy
            .unwrap_or_else(|| self.discovery.strategy_for(&route.service, None));
        let lease = self.discovery.checkout(&route.service, strategy)?;
        let (instance, guard) = lease.into_parts();

        let client_ip = client_identifier(&request);
        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(new_request_id);

        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, self.max_body_size)
            .await
            .map_err(|e| body_read_error(e, self.max_body_size))?;

        let mut target = format!("{}{}", instance.url.trim_end_matches('/'), route.forward_path);
        if let Some(query) = parts.uri.query() {
            target.push('?');
            target.push_str(query);
        }

        let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
            .map_err(|_| GatewayError::malformed("method", "is not a valid HTTP method"))?;
        let headers = outbound_headers(&parts.headers, &client_ip, &request_id);
        let timeout = self.timeouts.for_route(&route);

        debug!(
            request_id = %request_id,
            service = %route.service,
            instance_id = %instance.id,
            target = %target,
            in_flight = guard.in_flight(),
            "Dispatching upstream request"
        );

        let started = Instant::now();
        let dispatch = self.client.request(method, &target).headers(headers).body(body).send();
        let outcome = tokio::time::timeout(timeout, dispatch).await;

        let upstream = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(self.demote(&route.service, &instance.id, e.to_string())),
            Err(_) => {
                return Err(self.demote(
                    &route.service,
                    &instance.id,
                    format!("no response within {:?}", timeout),
                ))
            }
        };

        let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        self.metrics.record_histogram(
            "upstream_request_duration_seconds",
            &[("service", route.service.clone()), ("status", status.as_u16().to_string())],
            started.elapsed().as_secs_f64(),
        );
        self.metrics.increment_counter(
            "proxy_requests_total",
            &[("service", route.service.clone()), ("outcome", "success".to_string())],
        );

        let mut response_headers = HeaderMap::new();
        for (name, value) in upstream.headers() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                response_headers.append(name, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(&instance.id) {
            response_headers.insert(HeaderName::from_static(UPSTREAM_INSTANCE_HEADER), value);
        }
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response_headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
        }

        let relay = BodyRelay {
            chunks: Box::pin(upstream.bytes_stream()),
            _lease: guard,
            idle: timeout,
            discovery: self.discovery.clone(),
            metrics: self.metrics.clone(),
            service: route.service.clone(),
            instance_id: instance.id.clone(),
        };

        let mut response = Response::new(Body::from_stream(relay.into_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }

    fn demote(&self, service: &str, instance_id: &str, reason: String) -> GatewayError {
        demote_instance(&self.discovery, self.metrics.as_ref(), service, instance_id, reason)
    }
}

fn demote_instance(
    discovery: &Discovery,
    metrics: &dyn MetricStore,
    service: &str,
    instance_id: &str,
    reason: String,
) -> GatewayError {
    warn!(
        service = %service,
        instance_id = %instance_id,
        reason = %reason,
        "❌ Upstream dispatch failed, marking instance unhealthy"
    );
    discovery.health().report(service, instance_id, false);
    metrics.increment_counter(
        "proxy_requests_total",
        &[("service", service.to_string()), ("outcome", "upstream_error".to_string())],
    );
    GatewayError::upstream(service, instance_id, reason)
}

type ChunkStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Response body from the instance, carrying the connection lease
///
/// Every chunk must arrive within `idle`. A stalled or broken body ends the
/// stream with an error, demotes the instance and releases the lease.
struct BodyRelay {
    chunks: ChunkStream,
    _lease: ConnectionGuard,
    idle: Duration,
    discovery: Discovery,
    metrics: Arc<dyn MetricStore>,
    service: String,
    instance_id: String,
}

impl BodyRelay {
    fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send {
        stream::unfold(Some(self), |relay| async move {
            let Some(mut relay) = relay else {
                return None;
            };
            let next = tokio::time::timeout(relay.idle, relay.chunks.next()).await;
            match next {
                Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(relay))),
                Ok(None) => None,
                Ok(Some(Err(e))) => {
                    let reason = format!("response body failed: {}", e);
                    Some((Err(relay.fail(reason, io::ErrorKind::Other)), None))
                }
                Err(_) => {
                    let reason = format!("response body stalled for {:?}", relay.idle);
                    Some((Err(relay.fail(reason, io::ErrorKind::TimedOut)), None))
                }
            }
        })
    }

    fn fail(self, reason: String, kind: io::ErrorKind) -> io::Error {
        let err = demote_instance(
            &self.discovery,
            self.metrics.as_ref(),
            &self.service,
            &self.instance_id,
            reason,
        );
        io::Error::new(kind, err)
    }
}

/// Request headers for the instance: hop-by-hop and `Host` removed, proxy headers added
fn outbound_headers(incoming: &HeaderMap, client_ip: &str, request_id: &str) -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in incoming {
        let key = name.as_str();
        if is_hop_by_hop(key) || name == header::HOST || key == FORWARDED_FOR || key == REQUEST_ID_HEADER {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(key.as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }

    let existing = incoming
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let forwarded_for = match existing {
        // Without a peer address the caller was identified from this header
        Some(chain) if chain.split(',').next().map(str::trim) == Some(client_ip) => chain.to_string(),
        Some(chain) => format!("{}, {}", chain, client_ip),
        None => client_ip.to_string(),
    };
    let mut set = |name: &'static str, value: &str| {
        if let Ok(value) = reqwest::header::HeaderValue::from_str(value) {
            headers.insert(reqwest::header::HeaderName::from_static(name), value);
        }
    };
    set(FORWARDED_FOR, &forwarded_for);
    set(REQUEST_ID_HEADER, request_id);
    if let Some(host) = incoming.get(header::HOST).and_then(|v| v.to_str().ok()) {
        set(FORWARDED_HOST, host);
    }

    headers
}

/// Fallback handler for every data-plane path
pub async fn proxy_handler(State(proxy): State<Arc<UpstreamProxy>>, request: Request) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    match proxy.forward(request).await {
        Ok(response) => response,
        Err(e) => {
            info!(method = %method, path = %path, error = %e, "Proxy request rejected");
            e.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RouteDefinition;
    use crate::core::types::InstanceRegistration;
    use crate::discovery::ServiceRegistry;
    use crate::load_balancing::StrategyKind;
    use crate::observability::metrics::InMemoryMetricStore;

    #[test]
    fn test_outbound_headers_filtering() {
        let mut incoming = HeaderMap::new();
        incoming.insert(header::HOST, HeaderValue::from_static("gateway.local"));
        incoming.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        incoming.insert("x-custom", HeaderValue::from_static("kept"));
        incoming.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));

        let headers = outbound_headers(&incoming, "10.0.0.5", "req-1");
        assert!(headers.get("host").is_none());
        assert!(headers.get("connection").is_none());
        assert_eq!(headers.get("x-custom").unwrap(), "kept");
        assert_eq!(headers.get("authorization").unwrap(), "Bearer abc");
        assert_eq!(headers.get(FORWARDED_FOR).unwrap(), "10.0.0.5");
        assert_eq!(headers.get(FORWARDED_HOST).unwrap(), "gateway.local");
        assert_eq!(headers.get(REQUEST_ID_HEADER).unwrap(), "req-1");
    }

    #[test]
    fn test_forwarded_for_chain_is_extended() {
        let mut incoming = HeaderMap::new();
        incoming.insert(FORWARDED_FOR, HeaderValue::from_static("203.0.113.7"));

        let appended = outbound_headers(&incoming, "10.0.0.5", "r");
        assert_eq!(appended.get(FORWARDED_FOR).unwrap(), "203.0.113.7, 10.0.0.5");

        // The identifier already came from the header, so it is not repeated
        let unchanged = outbound_headers(&incoming, "203.0.113.7", "r");
        assert_eq!(unchanged.get(FORWARDED_FOR).unwrap(), "203.0.113.7");
    }

    #[test]
    fn test_timeout_precedence() {
        let mut timeouts = DispatchTimeouts::new(Duration::from_secs(10));
        timeouts
            .per_service
            .insert("user-service".to_string(), Duration::from_secs(3));

        let mut definition = RouteDefinition::new("/api/users", "user-service");
        let table = RouteTable::from_config(&[definition.clone()], None).unwrap();
        let route = table.lookup("/api/users/1").unwrap();
        assert_eq!(timeouts.for_route(&route), Duration::from_secs(3));

        definition.timeout = Some(Duration::from_millis(500));
        let table = RouteTable::from_config(&[definition], None).unwrap();
        let route = table.lookup("/api/users/1").unwrap();
        assert_eq!(timeouts.for_route(&route), Duration::from_millis(500));

        let generic = table.lookup("/api/other/x").unwrap();
        assert_eq!(timeouts.for_route(&generic), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_body_demotes_instance_and_releases_lease() {
        let registry = Arc::new(ServiceRegistry::new());
        registry
            .register("user-service", InstanceRegistration::new("u1", "http://localhost:8201"))
            .unwrap();
        let discovery = Discovery::new(registry.clone());
        let (instance, guard) = discovery
            .checkout("user-service", StrategyKind::FirstHealthy)
            .unwrap()
            .into_parts();
        let metrics = Arc::new(InMemoryMetricStore::new());

        let chunks: ChunkStream = Box::pin(
            stream::iter(vec![Ok::<_, reqwest::Error>(Bytes::from_static(b"partial"))]).chain(stream::pending()),
        );
        let relay = BodyRelay {
            chunks,
            _lease: guard,
            idle: Duration::from_millis(200),
            discovery: discovery.clone(),
            metrics: metrics.clone(),
            service: "user-service".to_string(),
            instance_id: instance.id.clone(),
        };
        let mut body = Box::pin(relay.into_stream());

        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"partial"));
        assert_eq!(registry.list("user-service")[0].connections, 1);

        let err = body.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(body.next().await.is_none());

        let instance = &registry.list("user-service")[0];
        assert!(!instance.healthy);
        assert_eq!(instance.connections, 0);
        assert_eq!(
            metrics.counter(
                "proxy_requests_total",
                &[
                    ("service", "user-service".to_string()),
                    ("outcome", "upstream_error".to_string())
                ]
            ),
            1
        );
    }
}
