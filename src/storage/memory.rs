//! # In-Memory Store
//!
//! `DashMap`-backed [`KeyValueStore`]. Expired keys are invisible to readers
//! immediately and physically removed by [`MemoryStore::sweep_expired`], which
//! the sweeper task calls on an interval.
//!
//! Time comes from `tokio::time::Instant`, so tests can drive expiry with a
//! paused clock.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Counter, KeyValueStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    /// A key stays live through its expiry instant and is gone strictly after it
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at >= now).unwrap_or(true)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    data: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remove every expired key; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.data.len())
    }

    /// Sweep expired keys every `every` until `token` is cancelled
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?every, "🧹 Rate window sweeper started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.sweep_expired();
                        if removed > 0 {
                            debug!(removed, remaining = self.data.len(), "Swept expired rate windows");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        Ok(self
            .data
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.data.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        match self.data.get_mut(key) {
            Some(mut entry) if entry.is_live(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        Ok(self
            .data
            .remove(key)
            .map(|(_, entry)| entry.is_live(now))
            .unwrap_or(false))
    }

    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<Counter> {
        let now = Instant::now();
        let mut entry = self.data.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: Some(now + ttl),
        });

        if !entry.is_live(now) {
            entry.value = "0".to_string();
            entry.expires_at = Some(now + ttl);
        }

        let current: u64 = entry.value.parse().map_err(|_| StoreError::NotACounter {
            key: key.to_string(),
        })?;
        let count = current + 1;
        entry.value = count.to_string();

        let expires_at = *entry.expires_at.get_or_insert(now + ttl);
        Ok(Counter {
            count,
            ttl: expires_at.saturating_duration_since(now),
        })
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_increment_creates_then_counts() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);

        let first = store.increment("rate_limit:api-auth:10.0.0.1", window).await.unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(first.ttl, window);

        tokio::time::advance(Duration::from_secs(10)).await;
        let second = store.increment("rate_limit:api-auth:10.0.0.1", window).await.unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(second.ttl, Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_counter_restarts() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(1);

        store.increment("k", window).await.unwrap();
        store.increment("k", window).await.unwrap();
        tokio::time::advance(Duration::from_millis(1001)).await;

        let fresh = store.increment("k", window).await.unwrap();
        assert_eq!(fresh.count, 1);
        assert_eq!(fresh.ttl, window);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_still_open_at_its_reset_instant() {
        let store = MemoryStore::new();
        let window = Duration::from_millis(1000);

        for _ in 0..3 {
            store.increment("k", window).await.unwrap();
        }
        tokio::time::advance(window).await;

        let at_reset = store.increment("k", window).await.unwrap();
        assert_eq!(at_reset.count, 4);
        assert_eq!(at_reset.ttl, Duration::ZERO);

        tokio::time::advance(Duration::from_millis(1)).await;
        let fresh = store.increment("k", window).await.unwrap();
        assert_eq!(fresh.count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_set_expire_delete() {
        let store = MemoryStore::new();
        store.set("a", "1", Some(Duration::from_secs(5))).await.unwrap();
        store.set("b", "2", None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));

        assert!(store.expire("b", Duration::from_secs(1)).await.unwrap());
        assert!(!store.expire("missing", Duration::from_secs(1)).await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get("b").await.unwrap(), None);
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));

        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_increment_rejects_non_counter() {
        let store = MemoryStore::new();
        store.set("k", "not-a-number", None).await.unwrap();
        assert!(matches!(
            store.increment("k", Duration::from_secs(1)).await,
            Err(StoreError::NotACounter { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired() {
        let store = MemoryStore::new();
        store.increment("short", Duration::from_secs(1)).await.unwrap();
        store.increment("long", Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.len(), 2);
        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_runs_until_cancelled() {
        let store = Arc::new(MemoryStore::new());
        store.increment("k", Duration::from_secs(1)).await.unwrap();

        let token = CancellationToken::new();
        let handle = store.clone().spawn_sweeper(Duration::from_secs(5), token.clone());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(store.is_empty());

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_atomic() {
        let store = Arc::new(MemoryStore::new());
        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment("shared", Duration::from_secs(60)).await })
            })
            .collect();

        let mut counts = Vec::new();
        for task in tasks {
            counts.push(task.await.unwrap().unwrap().count);
        }
        counts.sort_unstable();
        assert_eq!(counts, (1..=50).collect::<Vec<u64>>());
    }
}
