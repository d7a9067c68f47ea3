//! # Active Health Prober
//!
//! Periodically sends `GET <instance url><path>` to every registered instance
//! and feeds the results into the [`HealthTracker`]. An instance only flips
//! after `healthy_threshold` consecutive successes or `unhealthy_threshold`
//! consecutive failures, so one slow probe does not take it out of rotation.
//!
//! ## Rust Concepts Used
//!
//! - `futures::future::join_all` probes every instance of a round concurrently
//! - `tokio::time::interval` drives the rounds
//! - `CancellationToken` stops the background task on shutdown

use dashmap::DashMap;
use futures::future::join_all;
use reqwest::Client as HttpClient;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::config::HealthCheckConfig;
use crate::core::error::GatewayResult;
use crate::core::types::ServiceInstance;
use crate::discovery::health::{HealthTracker, HealthUpdate};
use crate::discovery::registry::ServiceRegistry;

/// Consecutive probe results for one instance
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Streak {
    successes: u32,
    failures: u32,
}

pub struct HealthProber {
    registry: Arc<ServiceRegistry>,
    tracker: HealthTracker,
    client: HttpClient,
    config: HealthCheckConfig,
    streaks: DashMap<(String, String), Streak>,
}

impl HealthProber {
    pub fn new(registry: Arc<ServiceRegistry>, config: HealthCheckConfig) -> GatewayResult<Self> {
        let client = HttpClient::builder().timeout(config.timeout).build()?;

        Ok(Self {
            tracker: HealthTracker::new(registry.clone()),
            registry,
            client,
            config,
            streaks: DashMap::new(),
        })
    }

    fn probe_url(&self, instance: &ServiceInstance) -> String {
        format!("{}{}", instance.url.trim_end_matches('/'), self.config.path)
    }

    /// Probe a single instance; `Err` carries the failure reason
    pub async fn probe(&self, instance: &ServiceInstance) -> Result<(), String> {
        let url = self.probe_url(instance);
        match timeout(self.config.timeout, self.client.get(&url).send()).await {
            Ok(Ok(response)) if response.status().is_success() => Ok(()),
            Ok(Ok(response)) => Err(format!("Unexpected status code: {}", response.status().as_u16())),
            Ok(Err(e)) => Err(format!("HTTP request failed: {}", e)),
            Err(_) => Err(format!("Health check timed out after {:?}", self.config.timeout)),
        }
    }

    /// Probe every registered instance once and apply threshold transitions
    ///
    /// Returns the number of instances probed.
    pub async fn run_once(&self) -> usize {
        let targets: Vec<(String, ServiceInstance)> = self
            .registry
            .service_names()
            .into_iter()
            .flat_map(|service| {
                self.registry
                    .list(&service)
                    .into_iter()
                    .map(move |instance| (service.clone(), instance))
            })
            .collect();

        let started = Instant::now();
        let results = join_all(targets.iter().map(|(_, instance)| self.probe(instance))).await;

        let mut seen = HashSet::with_capacity(targets.len());
        for ((service, instance), result) in targets.iter().zip(results) {
            let key = (service.clone(), instance.id.clone());
            seen.insert(key.clone());
            self.apply(service, instance, result);
        }

        self.streaks.retain(|key, _| seen.contains(key));

        debug!(
            instances = targets.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Health probe round complete"
        );
        targets.len()
    }

    fn apply(&self, service: &str, instance: &ServiceInstance, result: Result<(), String>) {
        let key = (service.to_string(), instance.id.clone());
        let streak = {
            let mut entry = self.streaks.entry(key).or_default();
            match &result {
                Ok(()) => {
                    entry.successes = entry.successes.saturating_add(1);
                    entry.failures = 0;
                }
                Err(_) => {
                    entry.failures = entry.failures.saturating_add(1);
                    entry.successes = 0;
                }
            }
            *entry
        };

        if let Err(reason) = &result {
            debug!(
                service = %service,
                instance_id = %instance.id,
                failures = streak.failures,
                reason = %reason,
                "Health probe failed"
            );
        }

        let verdict = if streak.successes >= self.config.healthy_threshold {
            Some(true)
        } else if streak.failures >= self.config.unhealthy_threshold {
            Some(false)
        } else {
            None
        };

        if let Some(healthy) = verdict {
            if self.tracker.report(service, &instance.id, healthy) == HealthUpdate::Changed {
                debug!(service = %service, instance_id = %instance.id, healthy, "Probe threshold reached");
            }
        }
    }

    /// Run probe rounds every `interval` until `token` is cancelled
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval = ?self.config.interval,
                path = %self.config.path,
                "🩺 Active health probing started"
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                }
            }

            info!("Active health probing stopped");
        })
    }
}
