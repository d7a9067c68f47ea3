//! # Rate Limiting Integration Tests
//!
//! Limit classes applied through the assembled router: 429 shape and headers,
//! per-caller windows, class selection by route, and the endpoints that are
//! never throttled.

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use service_gateway::core::config::{LimitClassConfig, RouteDefinition};
use service_gateway::middleware::{LimitClass, RateLimiter};
use service_gateway::storage::{KeyValueStore, MemoryStore};
use service_gateway::{Gateway, GatewayConfig};

fn class(max_requests: u32) -> LimitClassConfig {
    LimitClassConfig {
        window: Duration::from_secs(60),
        max_requests,
    }
}

fn limited_config(admin_max: u32, global_max: u32) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    let classes = &mut config.rate_limiting.classes;
    classes.insert("api-admin".to_string(), class(admin_max));
    classes.insert("api-global".to_string(), class(global_max));
    classes.insert("api-users".to_string(), class(1));
    config
}

fn create_test_server(config: GatewayConfig) -> TestServer {
    let gateway = Gateway::build(config, Arc::new(MemoryStore::new())).expect("gateway builds");
    TestServer::new(gateway.router().expect("router builds")).expect("Failed to create test server")
}

fn forwarded_for(ip: &'static str) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static("x-forwarded-for"),
        HeaderValue::from_static(ip),
    )
}

#[tokio::test]
async fn test_control_plane_admits_up_to_limit_then_rejects() {
    let server = create_test_server(limited_config(3, 1000));
    let (name, value) = forwarded_for("203.0.113.10");

    for expected_remaining in ["2", "1", "0"] {
        let response = server.get("/services").add_header(name.clone(), value.clone()).await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.header("x-ratelimit-limit"), "3");
        assert_eq!(response.header("x-ratelimit-remaining"), expected_remaining);
        let reset: u64 = response.header("x-ratelimit-reset").to_str().unwrap().parse().unwrap();
        assert!(reset > 0);
    }

    let response = server.get("/services").add_header(name, value).await;
    assert_eq!(response.status_code(), StatusCode::TOO_MANY_REQUESTS);

    let retry_after: u64 = response.header("retry-after").to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));

    let body: Value = response.json();
    assert_eq!(body["error"], "Rate limit exceeded");
    assert_eq!(body["limit"], 3);
    assert_eq!(body["remaining"], 0);
    assert_eq!(body["retryAfter"], retry_after);
    assert!(body["reset"].as_u64().unwrap() > 0);
    assert_eq!(
        body["message"],
        format!("Too many requests. Try again in {} seconds.", retry_after)
    );
}

#[tokio::test]
async fn test_callers_have_independent_windows() {
    let server = create_test_server(limited_config(1, 1000));
    let (name, first) = forwarded_for("203.0.113.10");
    let (_, second) = forwarded_for("198.51.100.20");

    assert_eq!(
        server.get("/lb/stats").add_header(name.clone(), first.clone()).await.status_code(),
        StatusCode::OK
    );
    assert_eq!(
        server.get("/lb/stats").add_header(name.clone(), first).await.status_code(),
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(
        server.get("/lb/stats").add_header(name, second).await.status_code(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn test_health_and_metrics_are_not_throttled() {
    let server = create_test_server(limited_config(1, 1));

    for _ in 0..5 {
        let response = server.get("/health").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }
}

#[tokio::test]
async fn test_proxied_routes_use_route_class() {
    let mut config = limited_config(1000, 1000);
    let mut users = RouteDefinition::new("/api/users", "user-service");
    users.limit_class = Some("api-users".to_string());
    config.routes.push(users);
    let server = create_test_server(config);

    // No instances registered: the request is admitted by the limiter and
    // then fails resolution, which still counts against the window
    let first = server.get("/api/users/1").await;
    assert_eq!(first.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(first.header("x-ratelimit-limit"), "1");

    let second = server.get("/api/users/1").await;
    assert_eq!(second.status_code(), StatusCode::TOO_MANY_REQUESTS);

    // Other proxied paths fall back to the global class
    let other = server.get("/api/orders/1").await;
    assert_eq!(other.header("x-ratelimit-limit"), "1000");
}

#[tokio::test]
async fn test_control_plane_and_proxy_windows_are_separate() {
    let server = create_test_server(limited_config(1, 1000));

    let response = server
        .post("/register")
        .json(&json!({ "serviceName": "user-service", "instance": { "id": "u1", "url": "http://localhost:8201" } }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(
        server.get("/services").await.status_code(),
        StatusCode::TOO_MANY_REQUESTS
    );

    let proxied = server.get("/api/ghost/1").await;
    assert_ne!(proxied.status_code(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_disabled_limiting_adds_no_headers() {
    let mut config = limited_config(1, 1);
    config.rate_limiting.enabled = false;
    let server = create_test_server(config);

    for _ in 0..3 {
        let response = server.get("/services").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }
}

#[test]
fn test_unknown_route_class_is_fatal_at_startup() {
    let mut config = GatewayConfig::default();
    let mut route = RouteDefinition::new("/api/users", "user-service");
    route.limit_class = Some("api-missing".to_string());
    config.routes.push(route);

    assert!(config.validate().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_window_expiry_restores_capacity() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let limiter = RateLimiter::new(
        [LimitClass::new("api-auth", Duration::from_secs(1), 2)],
        store,
    )
    .unwrap();

    assert!(limiter.check_limit("10.0.0.1", "api-auth").await.allowed);
    assert!(limiter.check_limit("10.0.0.1", "api-auth").await.allowed);
    let denied = limiter.check_limit("10.0.0.1", "api-auth").await;
    assert!(!denied.allowed);
    assert_eq!(denied.count, 3);

    tokio::time::advance(Duration::from_millis(1001)).await;
    let fresh = limiter.check_limit("10.0.0.1", "api-auth").await;
    assert!(fresh.allowed);
    assert_eq!(fresh.remaining, 1);
}

#[tokio::test(start_paused = true)]
async fn test_request_at_reset_instant_counts_in_old_window() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let limiter = RateLimiter::new(
        [LimitClass::new("api-auth", Duration::from_millis(1000), 3)],
        store,
    )
    .unwrap();

    for _ in 0..3 {
        assert!(limiter.check_limit("10.0.0.1", "api-auth").await.allowed);
    }

    tokio::time::advance(Duration::from_millis(1000)).await;
    let at_reset = limiter.check_limit("10.0.0.1", "api-auth").await;
    assert!(!at_reset.allowed);
    assert_eq!(at_reset.count, 4);

    tokio::time::advance(Duration::from_millis(1)).await;
    assert!(limiter.check_limit("10.0.0.1", "api-auth").await.allowed);
}
