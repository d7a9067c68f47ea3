//! # Key-Value Store Module
//!
//! Narrow storage capability behind the rate limiter. Two implementations:
//!
//! - [`MemoryStore`]: process-local `DashMap` with per-key expiry and a sweeper task
//! - [`RedisStore`]: shared Redis, so several gateway processes count against the
//!   same windows
//!
//! The only operation the limiter depends on for correctness is
//! [`KeyValueStore::increment`], which must be atomic per key and must arm the
//! key's TTL only when it creates the key.

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::core::error::GatewayError;

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by key-value stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Value at '{key}' is not a counter")]
    NotACounter { key: String },
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        GatewayError::store(err.to_string())
    }
}

/// Result of an atomic counter increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    /// Value after the increment
    pub count: u64,
    /// Time until the key expires
    pub ttl: Duration,
}

/// Storage capability used by the rate limiter
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Store a value, optionally expiring after `ttl`
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Set a key's TTL; `false` when the key does not exist
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Remove a key; `false` when it did not exist
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Atomically add one to the counter at `key`
    ///
    /// A missing or expired key starts at 1 with `ttl`; an existing key keeps
    /// its remaining TTL.
    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<Counter>;

    /// Backend name for logs and metrics
    fn backend(&self) -> &'static str;
}
