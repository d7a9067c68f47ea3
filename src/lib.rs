//! # Service Gateway Library
//!
//! A service registry with health tracking and instance selection, fronted by
//! an HTTP gateway that load-balances requests across registered instances and
//! applies fixed-window rate limits per caller.
//!
//! ## Module map
//! - `core`: configuration, the error taxonomy and the registry data model
//! - `discovery`: registry, health tracker, resolution, events and active probing
//! - `load_balancing`: instance selection strategies
//! - `storage`: key-value stores behind the rate limiter (memory, Redis)
//! - `middleware`: rate limiting for axum
//! - `gateway`: route table, upstream proxy, control-plane API and server
//! - `observability`: structured logging and metrics

/// Configuration, errors and shared data types
pub mod core;

/// Registry, health, resolution and registry events
pub mod discovery;

/// Route table, proxy, control-plane API and server assembly
pub mod gateway;

/// Selection strategies over healthy instances
pub mod load_balancing;

/// Axum middleware
pub mod middleware;

/// Logging and metrics
pub mod observability;

/// Key-value stores for rate windows
pub mod storage;

pub use core::config::GatewayConfig;
pub use core::error::{GatewayError, GatewayResult};
pub use core::types::{InstanceRegistration, ServiceInstance};
pub use discovery::{Discovery, ServiceRegistry};
pub use gateway::Gateway;
pub use load_balancing::StrategyKind;
