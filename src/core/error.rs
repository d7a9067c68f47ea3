//! # Error Handling Module
//!
//! Every failure the gateway can report lives in [`GatewayError`]. Each variant
//! maps to exactly one HTTP status, so the component that detects a failure can
//! convert it into the caller-visible response on the spot.
//!
//! ## Taxonomy
//!
//! | Variant             | Status | Side effects                                  |
//! |---------------------|--------|-----------------------------------------------|
//! | `UnknownService`    | 404    | none                                          |
//! | `NoHealthyInstance` | 503    | none                                          |
//! | `UpstreamError`     | 503    | instance demoted by the router before return  |
//! | `RateLimited`       | 429    | never touches registry or health state        |
//! | `MalformedRequest`  | 400    | none                                          |
//! | `InstanceNotFound`  | 404    | none                                          |
//! | `HostnameNotFound`  | 404    | none                                          |
//!
//! Upstream failures carry the connection-level reason for the logs, but the
//! response body only ever says "Service temporarily unavailable".

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Generic message returned to callers when dispatch to an instance fails.
pub const UPSTREAM_UNAVAILABLE_MESSAGE: &str = "Service temporarily unavailable";

/// Error types for the registry, balancer and rate limiter
///
/// The `#[error("...")]` attribute from `thiserror` implements `Display`,
/// which is what ends up in log lines.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// The service name has never been registered
    #[error("Unknown service: {service}")]
    UnknownService { service: String },

    /// The service is known but no instance is eligible for selection
    #[error("No healthy instances available for {service}")]
    NoHealthyInstance { service: String },

    /// Dispatch to the chosen instance failed at the connection level
    #[error("Upstream error from {service}/{instance}: {reason}")]
    UpstreamError {
        service: String,
        instance: String,
        reason: String,
    },

    /// Admission denied by the rate limiter
    #[error("Rate limit exceeded: {limit} requests, retry in {retry_after_secs}s")]
    RateLimited {
        limit: u32,
        retry_after_secs: u64,
        /// Window reset as epoch milliseconds
        reset_ms: u64,
    },

    /// Missing or invalid request fields
    #[error("Malformed request: {field} - {reason}")]
    MalformedRequest { field: String, reason: String },

    /// Request body exceeded `server.max_request_size`
    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// Instance lookup by id failed for a known or unknown service
    #[error("Service instance not found: {service}/{instance}")]
    InstanceNotFound { service: String, instance: String },

    /// Hostname matched no configured service and failed system resolution
    #[error("Hostname not found: {hostname}")]
    HostnameNotFound { hostname: String },

    /// Configuration errors (invalid config, missing files, bad limit tables)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Backing store errors (rate limit store unreachable, etc.)
    #[error("Store error: {message}")]
    Store { message: String },

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, listener errors, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },

    /// HTTP client errors outside of upstream dispatch (health probes, etc.)
    #[error("HTTP client error: {message}")]
    HttpClient { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn unknown_service<S: Into<String>>(service: S) -> Self {
        Self::UnknownService {
            service: service.into(),
        }
    }

    pub fn no_healthy_instance<S: Into<String>>(service: S) -> Self {
        Self::NoHealthyInstance {
            service: service.into(),
        }
    }

    /// Create an upstream error for a specific instance
    pub fn upstream<S: Into<String>, I: Into<String>, R: Into<String>>(
        service: S,
        instance: I,
        reason: R,
    ) -> Self {
        Self::UpstreamError {
            service: service.into(),
            instance: instance.into(),
            reason: reason.into(),
        }
    }

    /// Create a malformed request error for a named field
    pub fn malformed<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self::MalformedRequest {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn instance_not_found<S: Into<String>, I: Into<String>>(service: S, instance: I) -> Self {
        Self::InstanceNotFound {
            service: service.into(),
            instance: instance.into(),
        }
    }

    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownService { .. } => StatusCode::NOT_FOUND,
            Self::NoHealthyInstance { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamError { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::MalformedRequest { .. } => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InstanceNotFound { .. } => StatusCode::NOT_FOUND,
            Self::HostnameNotFound { .. } => StatusCode::NOT_FOUND,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::HttpClient { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Whether the caller may reasonably try again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoHealthyInstance { .. }
                | Self::UpstreamError { .. }
                | Self::RateLimited { .. }
                | Self::Store { .. }
                | Self::HttpClient { .. }
                | Self::Io { .. }
        )
    }

    /// Message safe to show to callers
    ///
    /// Upstream failures never leak the connection-level reason.
    pub fn public_message(&self) -> String {
        match self {
            Self::UpstreamError { .. } => UPSTREAM_UNAVAILABLE_MESSAGE.to_string(),
            other => other.to_string(),
        }
    }

    /// Get a string representation of the error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::UnknownService { .. } => "unknown_service",
            Self::NoHealthyInstance { .. } => "no_healthy_instance",
            Self::UpstreamError { .. } => "upstream_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::MalformedRequest { .. } => "malformed_request",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::InstanceNotFound { .. } => "instance_not_found",
            Self::HostnameNotFound { .. } => "hostname_not_found",
            Self::Configuration { .. } => "configuration_error",
            Self::Store { .. } => "store_error",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
            Self::HttpClient { .. } => "http_client_error",
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpClient {
            message: err.to_string(),
        }
    }
}

/// Convert errors into JSON responses with the mapped status code
///
/// Rate-limit rejections use their own body shape and carry `Retry-After`.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if let Self::RateLimited {
            limit,
            retry_after_secs,
            reset_ms,
        } = self
        {
            let body = json!({
                "error": "Rate limit exceeded",
                "message": format!("Too many requests. Try again in {} seconds.", retry_after_secs),
                "limit": limit,
                "remaining": 0,
                "reset": reset_ms,
                "retryAfter": retry_after_secs,
            });
            let mut response = (status, Json(body)).into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
            return response;
        }

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.public_message(),
                "type": self.error_type(),
                "retryable": self.is_retryable(),
            }
        });

        (status, Json(error_response)).into_response()
    }
}
