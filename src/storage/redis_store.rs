//! # Redis Store
//!
//! Redis-backed [`KeyValueStore`] over a multiplexed `ConnectionManager`, which
//! reconnects on its own after the server drops the connection. Every key is
//! written under a configurable prefix.
//!
//! Counters use one `MULTI` pipeline of `INCR`, `PEXPIRE ... NX` and `PTTL`, so
//! the TTL is armed exactly once per window even with many gateways writing.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};
use std::time::Duration;
use tracing::info;

use super::{Counter, KeyValueStore, StoreError, StoreResult};

pub struct RedisStore {
    manager: ConnectionManager,
    key_prefix: String,
}

impl RedisStore {
    /// Connect to Redis; fails when the server is unreachable
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;

        info!(url = %url, "Redis rate limit store connected");

        Ok(Self {
            manager,
            key_prefix: key_prefix.into(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn millis(ttl: Duration) -> u64 {
        u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
    }

    /// Round-trip a PING
    pub async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("unexpected PING reply: {}", reply)))
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.full_key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(Self::millis(ttl));
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(self.full_key(key))
            .arg(Self::millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    /// Redis evicts a key at its PEXPIRE deadline, so a request landing in
    /// that exact millisecond may already open a new window. The in-memory
    /// store keeps the old window through the deadline.
    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<Counter> {
        let mut conn = self.manager.clone();
        let full_key = self.full_key(key);
        let window_ms = Self::millis(ttl);

        let (count, remaining_ms): (u64, i64) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(&full_key)
            .cmd("PEXPIRE")
            .arg(&full_key)
            .arg(window_ms)
            .arg("NX")
            .ignore()
            .cmd("PTTL")
            .arg(&full_key)
            .query_async(&mut conn)
            .await?;

        // PTTL is negative when the key has no expiry
        let ttl = if remaining_ms > 0 {
            Duration::from_millis(remaining_ms as u64)
        } else {
            ttl
        };

        Ok(Counter { count, ttl })
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
