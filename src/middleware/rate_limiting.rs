//! # Rate Limiting
//!
//! Fixed-window admission control per `(caller, limit class)`.
//!
//! ## Window semantics
//! The first request of a window creates the counter with a TTL of the class
//! window; later requests increment it until the store expires the key. The
//! request is admitted while `count <= max_requests`.
//!
//! ## Failure policy
//! If the backing store errors the request is admitted (fail-open) and the
//! decision carries an advisory `error`. A class name with no entry in the
//! table is admitted without limiting; unknown classes in routing config are
//! rejected at startup instead.
//!
//! ## Architecture
//! - [`RateLimiter`]: decisions against a [`KeyValueStore`]
//! - [`rate_limit`]: axum middleware that turns decisions into 429s and headers
//! - [`LimitScope`]: which class a request is counted under

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::config::RateLimitingConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::gateway::routes::RouteTable;
use crate::observability::metrics::{MetricStore, PrometheusMetricStore};
use crate::storage::KeyValueStore;

/// Advisory attached to decisions made while the store is unreachable
pub const STORE_UNAVAILABLE_ADVISORY: &str = "Rate limit service unavailable";

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// A named window/limit pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitClass {
    pub name: String,
    pub window: Duration,
    pub max_requests: u32,
}

impl LimitClass {
    pub fn new<S: Into<String>>(name: S, window: Duration, max_requests: u32) -> Self {
        Self {
            name: name.into(),
            window,
            max_requests,
        }
    }
}

/// Outcome of a limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Class maximum; `None` when no class applied
    pub limit: Option<u32>,
    pub remaining: u32,
    /// Window reset as epoch milliseconds
    pub reset_time: u64,
    /// Requests counted in the current window
    pub count: u64,
    /// Advisory set when the decision was made without the store
    pub error: Option<String>,
}

impl RateLimitDecision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: None,
            remaining: u32::MAX,
            reset_time: 0,
            count: 0,
            error: None,
        }
    }

    /// Whole seconds until the window resets, at least one
    pub fn retry_after_secs(&self) -> u64 {
        let now = now_millis();
        let wait_ms = self.reset_time.saturating_sub(now);
        wait_ms.div_ceil(1000).max(1)
    }

    /// Write the `X-RateLimit-*` headers for this decision
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        let Some(limit) = self.limit else {
            return;
        };
        let values = [
            (LIMIT_HEADER, u64::from(limit)),
            (REMAINING_HEADER, u64::from(self.remaining)),
            (RESET_HEADER, self.reset_time),
        ];
        for (name, value) in values {
            headers.insert(HeaderName::from_static(name), HeaderValue::from(value));
        }
    }

    fn rejection(&self) -> GatewayError {
        GatewayError::RateLimited {
            limit: self.limit.unwrap_or(0),
            retry_after_secs: self.retry_after_secs(),
            reset_ms: self.reset_time,
        }
    }
}

fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Fixed-window rate limiter over a key-value store
pub struct RateLimiter {
    classes: HashMap<String, LimitClass>,
    store: Arc<dyn KeyValueStore>,
    metrics: Arc<dyn MetricStore>,
}

impl RateLimiter {
    /// Build a limiter; a class with a zero window or zero maximum is a configuration error
    pub fn new<I>(classes: I, store: Arc<dyn KeyValueStore>) -> GatewayResult<Self>
    where
        I: IntoIterator<Item = LimitClass>,
    {
        let mut table = HashMap::new();
        for class in classes {
            if class.window.is_zero() || class.max_requests == 0 {
                return Err(GatewayError::config(format!(
                    "Limit class '{}' needs a positive window and max_requests",
                    class.name
                )));
            }
            table.insert(class.name.clone(), class);
        }

        Ok(Self {
            classes: table,
            store,
            metrics: Arc::new(PrometheusMetricStore),
        })
    }

    pub fn from_config(config: &RateLimitingConfig, store: Arc<dyn KeyValueStore>) -> GatewayResult<Self> {
        let classes = config
            .classes
            .iter()
            .map(|(name, class)| LimitClass::new(name.clone(), class.window, class.max_requests));
        Self::new(classes, store)
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricStore>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn class(&self, name: &str) -> Option<&LimitClass> {
        self.classes.get(name)
    }

    pub fn store_backend(&self) -> &'static str {
        self.store.backend()
    }

    fn key(class: &str, identifier: &str) -> String {
        format!("rate_limit:{}:{}", class, identifier)
    }

    /// Count one request from `identifier` against `class`
    pub async fn check_limit(&self, identifier: &str, class: &str) -> RateLimitDecision {
        let Some(limit) = self.classes.get(class) else {
            debug!(class = %class, "No such limit class, admitting without limiting");
            return RateLimitDecision::unlimited();
        };

        let decision = match self.store.increment(&Self::key(class, identifier), limit.window).await {
            Ok(counter) => {
                let max = u64::from(limit.max_requests);
                let ttl_ms = u64::try_from(counter.ttl.as_millis()).unwrap_or(u64::MAX);
                RateLimitDecision {
                    allowed: counter.count <= max,
                    limit: Some(limit.max_requests),
                    remaining: u32::try_from(max.saturating_sub(counter.count)).unwrap_or(0),
                    reset_time: now_millis().saturating_add(ttl_ms),
                    count: counter.count,
                    error: None,
                }
            }
            Err(e) => {
                warn!(
                    class = %class,
                    backend = self.store.backend(),
                    error = %e,
                    "Rate limit store unavailable, failing open"
                );
                let window_ms = u64::try_from(limit.window.as_millis()).unwrap_or(u64::MAX);
                RateLimitDecision {
                    allowed: true,
                    limit: Some(limit.max_requests),
                    remaining: limit.max_requests,
                    reset_time: now_millis().saturating_add(window_ms),
                    count: 0,
                    error: Some(STORE_UNAVAILABLE_ADVISORY.to_string()),
                }
            }
        };

        let outcome = match (&decision.error, decision.allowed) {
            (Some(_), _) => "fail_open",
            (None, true) => "allowed",
            (None, false) => "denied",
        };
        self.metrics.increment_counter(
            "rate_limit_decisions_total",
            &[("class", class.to_string()), ("outcome", outcome.to_string())],
        );

        decision
    }
}

/// Which class a request is counted under
#[derive(Clone)]
pub enum LimitScope {
    /// Every request uses this class
    Fixed(String),
    /// The matching route's class, else `default_class`
    Routed {
        routes: Arc<RouteTable>,
        default_class: String,
    },
}

impl LimitScope {
    pub fn class_for(&self, path: &str) -> String {
        match self {
            Self::Fixed(class) => class.clone(),
            Self::Routed { routes, default_class } => routes
                .limit_class_for(path)
                .unwrap_or_else(|| default_class.clone()),
        }
    }
}

/// Middleware state: the limiter plus the scope it applies to
#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub scope: LimitScope,
}

impl RateLimitState {
    pub fn new(limiter: Arc<RateLimiter>, scope: LimitScope) -> Self {
        Self { limiter, scope }
    }
}

/// Caller identity: peer address, else first `X-Forwarded-For` entry, else `unknown`
pub fn client_identifier(request: &Request) -> String {
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }

    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "unknown".to_string())
}

/// Rate limiting middleware for axum
pub async fn rate_limit(State(state): State<RateLimitState>, request: Request, next: Next) -> Response {
    let identifier = client_identifier(&request);
    let class = state.scope.class_for(request.uri().path());
    let decision = state.limiter.check_limit(&identifier, &class).await;

    if !decision.allowed {
        warn!(
            client = %identifier,
            class = %class,
            count = decision.count,
            "🚫 Rate limit exceeded"
        );
        let mut response = decision.rejection().into_response();
        decision.apply_headers(response.headers_mut());
        return response;
    }

    let mut response = next.run(request).await;
    decision.apply_headers(response.headers_mut());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Counter, MemoryStore, StoreError, StoreResult};
    use async_trait::async_trait;

    struct UnreachableStore;

    #[async_trait]
    impl KeyValueStore for UnreachableStore {
        async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn expire(&self, _key: &str, _ttl: Duration) -> StoreResult<bool> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn delete(&self, _key: &str) -> StoreResult<bool> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn increment(&self, _key: &str, _ttl: Duration) -> StoreResult<Counter> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        fn backend(&self) -> &'static str {
            "unreachable"
        }
    }

    fn limiter(max: u32, window: Duration) -> RateLimiter {
        RateLimiter::new(
            [LimitClass::new("test", window, max)],
            Arc::new(MemoryStore::new()),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_admits_up_to_max_then_resets() {
        let limiter = limiter(3, Duration::from_millis(1000));

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check_limit("10.0.0.1", "test").await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let denied = limiter.check_limit("10.0.0.1", "test").await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.count, 4);

        tokio::time::advance(Duration::from_millis(1001)).await;
        let fresh = limiter.check_limit("10.0.0.1", "test").await;
        assert!(fresh.allowed);
        assert_eq!(fresh.count, 1);
    }

    #[tokio::test]
    async fn test_callers_are_counted_separately() {
        let limiter = limiter(1, Duration::from_secs(60));
        assert!(limiter.check_limit("a", "test").await.allowed);
        assert!(!limiter.check_limit("a", "test").await.allowed);
        assert!(limiter.check_limit("b", "test").await.allowed);
    }

    #[tokio::test]
    async fn test_unknown_class_is_unlimited() {
        let limiter = limiter(1, Duration::from_secs(60));
        for _ in 0..5 {
            let decision = limiter.check_limit("a", "no-such-class").await;
            assert!(decision.allowed);
            assert_eq!(decision.limit, None);
        }
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let metrics = Arc::new(crate::observability::metrics::InMemoryMetricStore::new());
        let limiter = RateLimiter::new(
            [LimitClass::new("api-auth", Duration::from_secs(60), 100)],
            Arc::new(UnreachableStore),
        )
        .unwrap()
        .with_metrics(metrics.clone());

        let decision = limiter.check_limit("10.0.0.1", "api-auth").await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 100);
        assert_eq!(decision.error.as_deref(), Some(STORE_UNAVAILABLE_ADVISORY));
        assert_eq!(
            metrics.counter(
                "rate_limit_decisions_total",
                &[("class", "api-auth".to_string()), ("outcome", "fail_open".to_string())]
            ),
            1
        );
    }

    #[test]
    fn test_malformed_class_table_is_rejected() {
        let zero_window = RateLimiter::new(
            [LimitClass::new("x", Duration::ZERO, 10)],
            Arc::new(MemoryStore::new()),
        );
        let zero_max = RateLimiter::new(
            [LimitClass::new("x", Duration::from_secs(1), 0)],
            Arc::new(MemoryStore::new()),
        );
        assert!(zero_window.is_err());
        assert!(zero_max.is_err());
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let decision = RateLimitDecision {
            allowed: false,
            limit: Some(3),
            remaining: 0,
            reset_time: now_millis() + 1500,
            count: 4,
            error: None,
        };
        assert_eq!(decision.retry_after_secs(), 2);

        let elapsed = RateLimitDecision {
            reset_time: 0,
            ..decision
        };
        assert_eq!(elapsed.retry_after_secs(), 1);
    }

    #[test]
    fn test_client_identifier_sources() {
        let with_forwarded = Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(client_identifier(&with_forwarded), "203.0.113.7");

        let mut with_peer = Request::builder()
            .header("x-forwarded-for", "203.0.113.7")
            .body(axum::body::Body::empty())
            .unwrap();
        with_peer
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 168, 1, 9], 4000))));
        assert_eq!(client_identifier(&with_peer), "192.168.1.9");

        let anonymous = Request::builder().body(axum::body::Body::empty()).unwrap();
        assert_eq!(client_identifier(&anonymous), "unknown");
    }
}
