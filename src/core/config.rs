//! # Configuration Module
//!
//! Startup configuration for the gateway. Everything here is read once, validated
//! once and then treated as immutable: the limit-class table in particular must not
//! change while windows are being counted against it.
//!
//! ## Key Features
//! - YAML/JSON configuration parsing with serde
//! - Durations written the human way (`"30s"`, `"1m"`) via `humantime_serde`
//! - Environment variable overrides (`GATEWAY_<SECTION>_<FIELD>`)
//! - Validation that reports every problem at once, so a bad file fails at startup
//!   instead of on the first request

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::warn;
use url::Url;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::InstanceRegistration;

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener settings
    pub server: ServerConfig,

    /// Upstream dispatch settings (timeouts, per-service overrides)
    pub upstream: UpstreamConfig,

    /// Path-prefix routes to services
    pub routes: Vec<RouteDefinition>,

    /// Limit classes and the backing store for rate windows
    pub rate_limiting: RateLimitingConfig,

    /// Registry seeding, strategy defaults and active health checks
    pub discovery: DiscoveryConfig,

    /// Logging and metrics
    pub observability: ObservabilityConfig,
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: GatewayConfig = serde_yaml::from_str(&content)?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from JSON
    pub async fn load_from_json<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: GatewayConfig = serde_json::from_str(&content)?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a path, picking the parser from the file extension
    pub async fn load<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        if path.as_ref().extension().and_then(|s| s.to_str()) == Some("json") {
            Self::load_from_json(path).await
        } else {
            Self::load_from_file(path).await
        }
    }

    /// Load from a path, falling back to defaults when the file does not exist
    ///
    /// A file that exists but fails to parse or validate is still an error.
    pub async fn load_or_default<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        if tokio::fs::try_exists(path.as_ref()).await.unwrap_or(false) {
            return Self::load(path).await;
        }

        warn!(
            path = %path.as_ref().display(),
            "Configuration file not found, using built-in defaults"
        );
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Environment variables follow the pattern: GATEWAY_<SECTION>_<FIELD>
    /// For example: GATEWAY_SERVER_HTTP_PORT=8000
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> GatewayResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("GATEWAY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }

        if let Some(port) = lookup("GATEWAY_SERVER_HTTP_PORT") {
            self.server.http_port = port
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_SERVER_HTTP_PORT: {}", e)))?;
        }

        if let Some(size) = lookup("GATEWAY_SERVER_MAX_REQUEST_SIZE") {
            self.server.max_request_size = size.parse().map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_SERVER_MAX_REQUEST_SIZE: {}", e))
            })?;
        }

        if let Some(timeout) = lookup("GATEWAY_UPSTREAM_TIMEOUT") {
            self.upstream.default_timeout = humantime::parse_duration(&timeout)
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_UPSTREAM_TIMEOUT: {}", e)))?;
        }

        if let Some(enabled) = lookup("GATEWAY_RATE_LIMIT_ENABLED") {
            self.rate_limiting.enabled = enabled
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_RATE_LIMIT_ENABLED: {}", e)))?;
        }

        if let Some(url) = lookup("GATEWAY_RATE_LIMIT_REDIS_URL") {
            let key_prefix = match &self.rate_limiting.store {
                RateLimitStoreConfig::Redis { key_prefix, .. } => key_prefix.clone(),
                RateLimitStoreConfig::Memory => default_redis_key_prefix(),
            };
            self.rate_limiting.store = RateLimitStoreConfig::Redis { url, key_prefix };
        }

        if let Some(enabled) = lookup("GATEWAY_HEALTH_CHECK_ENABLED") {
            self.discovery.health_check.enabled = enabled.parse().map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_HEALTH_CHECK_ENABLED: {}", e))
            })?;
        }

        if let Some(level) = lookup("GATEWAY_LOG_LEVEL") {
            self.observability.logging.level = level;
        }

        if let Some(format) = lookup("GATEWAY_LOG_FORMAT") {
            self.observability.logging.format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" | "pretty" => LogFormat::Text,
                other => {
                    return Err(GatewayError::config(format!(
                        "Invalid GATEWAY_LOG_FORMAT: {}",
                        other
                    )))
                }
            };
        }

        if let Some(enabled) = lookup("GATEWAY_METRICS_ENABLED") {
            self.observability.metrics.prometheus_enabled = enabled
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_METRICS_ENABLED: {}", e)))?;
        }

        Ok(())
    }

    /// Configuration validation with every problem collected into one error
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("http_port must be greater than 0".to_string());
        }
        if self.server.bind_address.is_empty() {
            errors.push("bind_address cannot be empty".to_string());
        }
        if self.server.max_request_size == 0 {
            errors.push("max_request_size must be greater than 0".to_string());
        }

        if self.upstream.default_timeout.is_zero() {
            errors.push("upstream default_timeout must be greater than 0".to_string());
        }
        for (service, settings) in &self.upstream.services {
            if settings.timeout.map(|t| t.is_zero()).unwrap_or(false) {
                errors.push(format!("upstream timeout for '{}' must be greater than 0", service));
            }
        }

        self.validate_limit_classes(&mut errors);
        self.validate_routes(&mut errors);
        self.validate_discovery(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )))
        }
    }

    fn validate_limit_classes(&self, errors: &mut Vec<String>) {
        let limits = &self.rate_limiting;
        if !limits.enabled {
            return;
        }

        if limits.classes.is_empty() {
            errors.push("rate_limiting.classes cannot be empty when rate limiting is enabled".to_string());
        }

        for (name, class) in &limits.classes {
            if name.is_empty() {
                errors.push("limit class names cannot be empty".to_string());
            }
            if class.window.is_zero() {
                errors.push(format!("limit class '{}' window must be greater than 0", name));
            }
            if class.max_requests == 0 {
                errors.push(format!("limit class '{}' max_requests must be greater than 0", name));
            }
        }

        for (label, class) in [
            ("default_class", &limits.default_class),
            ("control_plane_class", &limits.control_plane_class),
        ] {
            if !limits.classes.contains_key(class) {
                errors.push(format!("rate_limiting.{} '{}' is not a defined limit class", label, class));
            }
        }

        if limits.sweep_interval.is_zero() {
            errors.push("rate_limiting.sweep_interval must be greater than 0".to_string());
        }

        if let RateLimitStoreConfig::Redis { url, .. } = &limits.store {
            if let Err(e) = Url::parse(url) {
                errors.push(format!("Invalid rate limit redis url '{}': {}", url, e));
            }
        }
    }

    fn validate_routes(&self, errors: &mut Vec<String>) {
        let mut seen = HashSet::new();

        for route in &self.routes {
            if !route.prefix.starts_with('/') || route.prefix.len() < 2 {
                errors.push(format!(
                    "Route prefix '{}' must start with '/' and name at least one segment",
                    route.prefix
                ));
            }
            if route.prefix.contains(':') || route.prefix.contains('*') || route.prefix.contains('{') {
                errors.push(format!("Route prefix '{}' must be a literal path", route.prefix));
            }
            if !seen.insert(route.prefix.trim_end_matches('/')) {
                errors.push(format!("Duplicate route prefix: {}", route.prefix));
            }
            if route.service.is_empty() {
                errors.push(format!("Route '{}' must name a service", route.prefix));
            }
            if route.timeout.map(|t| t.is_zero()).unwrap_or(false) {
                errors.push(format!("Route '{}' timeout must be greater than 0", route.prefix));
            }
            if let Some(class) = &route.limit_class {
                if self.rate_limiting.enabled && !self.rate_limiting.classes.contains_key(class) {
                    errors.push(format!(
                        "Route '{}' references unknown limit class '{}'",
                        route.prefix, class
                    ));
                }
            }
        }
    }

    fn validate_discovery(&self, errors: &mut Vec<String>) {
        for (service, instances) in &self.discovery.seed {
            if service.is_empty() {
                errors.push("Seeded service names cannot be empty".to_string());
            }
            let mut ids = HashSet::new();
            for instance in instances {
                if instance.id.is_empty() || instance.url.is_empty() {
                    errors.push(format!("Seeded instance of '{}' needs both id and url", service));
                    continue;
                }
                if !ids.insert(instance.id.as_str()) {
                    errors.push(format!("Duplicate seeded instance '{}' in '{}'", instance.id, service));
                }
                if let Err(e) = Url::parse(&instance.url) {
                    errors.push(format!(
                        "Invalid url '{}' for seeded instance '{}' of '{}': {}",
                        instance.url, instance.id, service, e
                    ));
                }
                if instance.weight == Some(0) {
                    errors.push(format!(
                        "Seeded instance '{}' of '{}' must have a positive weight",
                        instance.id, service
                    ));
                }
            }
        }

        let health = &self.discovery.health_check;
        if health.enabled {
            if health.interval.is_zero() {
                errors.push("health_check.interval must be greater than 0".to_string());
            }
            if health.timeout.is_zero() {
                errors.push("health_check.timeout must be greater than 0".to_string());
            }
            if health.healthy_threshold == 0 || health.unhealthy_threshold == 0 {
                errors.push("health_check thresholds must be greater than 0".to_string());
            }
            if !health.path.starts_with('/') {
                errors.push(format!("health_check.path '{}' must start with '/'", health.path));
            }
        }

        if self.discovery.event_buffer == 0 {
            errors.push("discovery.event_buffer must be greater than 0".to_string());
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_address: String,

    /// HTTP port for both the control plane and proxied traffic
    pub http_port: u16,

    /// Maximum buffered request body size forwarded upstream
    pub max_request_size: usize,

    /// How long in-flight requests get to finish on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8000,
            max_request_size: 10 * 1024 * 1024, // 10MB
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Upstream dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Timeout for a dispatch when neither route nor service overrides it
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Per-service overrides keyed by service name
    pub services: HashMap<String, ServiceSettings>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            services: HashMap::new(),
        }
    }
}

/// Per-service dispatch overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Strategy used when the request does not pick one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

/// Route definition mapping a path prefix to a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDefinition {
    /// Literal path prefix, e.g. `/api/users`
    pub prefix: String,

    /// Target service name
    pub service: String,

    /// Selection strategy for this route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,

    /// Drop the prefix before forwarding (mount-point semantics)
    #[serde(default = "default_true")]
    pub strip_prefix: bool,

    /// Route-specific dispatch timeout
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Limit class applied to this route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_class: Option<String>,
}

impl RouteDefinition {
    pub fn new<P: Into<String>, S: Into<String>>(prefix: P, service: S) -> Self {
        Self {
            prefix: prefix.into(),
            service: service.into(),
            strategy: None,
            strip_prefix: true,
            timeout: None,
            limit_class: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitingConfig {
    pub enabled: bool,

    /// Class used for proxied routes without their own class
    pub default_class: String,

    /// Class used for the registry/control-plane endpoints
    pub control_plane_class: String,

    /// Limit-class table, immutable after startup
    pub classes: HashMap<String, LimitClassConfig>,

    /// Backing store for rate windows
    pub store: RateLimitStoreConfig,

    /// How often expired in-memory windows are swept
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        let minute = Duration::from_secs(60);
        let classes = [
            ("api-global", 1000),
            ("api-auth", 100),
            ("api-users", 500),
            ("api-admin", 200),
        ]
        .into_iter()
        .map(|(name, max_requests)| {
            (
                name.to_string(),
                LimitClassConfig {
                    window: minute,
                    max_requests,
                },
            )
        })
        .collect();

        Self {
            enabled: true,
            default_class: "api-global".to_string(),
            control_plane_class: "api-admin".to_string(),
            classes,
            store: RateLimitStoreConfig::Memory,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// A single limit class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitClassConfig {
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub max_requests: u32,
}

/// Rate window storage backends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RateLimitStoreConfig {
    /// Process-local DashMap store
    Memory,
    /// Shared Redis store
    Redis {
        url: String,
        #[serde(default = "default_redis_key_prefix")]
        key_prefix: String,
    },
}

fn default_redis_key_prefix() -> String {
    "gateway:".to_string()
}

impl Default for RateLimitStoreConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Strategy used when neither request, route nor service picks one
    pub default_strategy: String,

    /// Instances registered at startup, keyed by service name
    pub seed: HashMap<String, Vec<InstanceRegistration>>,

    /// Hostname to service table for `/resolve/:hostname`
    pub hostnames: HashMap<String, String>,

    /// Service receiving proxied requests that match no route
    pub default_service: Option<String>,

    /// Active health checking
    pub health_check: HealthCheckConfig,

    /// Capacity of the registry event channel
    pub event_buffer: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            default_strategy: "round-robin".to_string(),
            seed: HashMap::new(),
            hostnames: HashMap::new(),
            default_service: None,
            health_check: HealthCheckConfig::default(),
            event_buffer: 1024,
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,

    /// Health check path appended to each instance url
    pub path: String,

    /// Check interval
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Healthy threshold (consecutive successes)
    pub healthy_threshold: u32,

    /// Unhealthy threshold (consecutive failures)
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "/health".to_string(),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            healthy_threshold: 2,
            unhealthy_threshold: 3,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,

    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "service_gateway=info,tower_http=info".to_string(),
            format: LogFormat::Json,
        }
    }
}

/// Log line formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Text,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics
    pub prometheus_enabled: bool,

    /// Metrics endpoint path
    pub endpoint_path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prometheus_enabled: true,
            endpoint_path: "/metrics".to_string(),
        }
    }
}
