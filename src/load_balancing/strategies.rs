//! # Selection Strategies
//!
//! Pick one instance out of a service's *healthy* candidates. Strategies never
//! see unhealthy instances and never mutate connection counters; the only
//! state any of them touches is the per-service [`RotationCursor`].
//!
//! ## Algorithms
//!
//! 1. **Round Robin**: `candidates[cursor % len]`, then advance the cursor
//! 2. **Random**: uniform over the candidates
//! 3. **Least Connections**: fewest in-flight dispatches, ties go to the earliest
//! 4. **Weighted**: random, proportional to `weight`
//! 5. **First Healthy**: the first candidate; used for unrecognized names
//!
//! ## Round-robin fairness
//!
//! The cursor is reduced modulo the *current* candidate count. When an instance
//! joins or turns unhealthy, the next pick may repeat or skip an instance once;
//! fairness is only guaranteed while the healthy set is stable.

use rand::Rng;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use crate::core::types::ServiceInstance;

/// Per-service rotation counter, persisted across selections
#[derive(Debug, Default)]
pub struct RotationCursor(AtomicUsize);

impl RotationCursor {
    pub fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// Return the current position and advance by one, wrapping on overflow
    pub fn advance(&self) -> usize {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    pub fn position(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Core trait for instance selection
pub trait BalancingStrategy: Send + Sync {
    /// Choose one of `candidates`, or `None` when there is nothing to choose from
    fn select<'a>(
        &self,
        candidates: &'a [ServiceInstance],
        cursor: &RotationCursor,
    ) -> Option<&'a ServiceInstance>;

    /// Algorithm name for metrics and logging
    fn name(&self) -> &'static str;
}

/// Strategy names accepted on the wire and in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StrategyKind {
    #[default]
    RoundRobin,
    Random,
    LeastConnections,
    Weighted,
    FirstHealthy,
}

impl StrategyKind {
    /// Parse a strategy name; anything unrecognized selects the first healthy instance
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "round-robin" | "roundrobin" => Self::RoundRobin,
            "random" => Self::Random,
            "least-connections" | "leastconnections" => Self::LeastConnections,
            "weighted" | "weighted-random" => Self::Weighted,
            _ => Self::FirstHealthy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.strategy().name()
    }

    /// The stateless strategy implementation for this kind
    pub fn strategy(&self) -> &'static dyn BalancingStrategy {
        match self {
            Self::RoundRobin => &RoundRobin,
            Self::Random => &RandomSelection,
            Self::LeastConnections => &LeastConnections,
            Self::Weighted => &WeightedRandom,
            Self::FirstHealthy => &FirstHealthy,
        }
    }

    pub fn select<'a>(
        &self,
        candidates: &'a [ServiceInstance],
        cursor: &RotationCursor,
    ) -> Option<&'a ServiceInstance> {
        let selected = self.strategy().select(candidates, cursor);
        if let Some(instance) = selected {
            debug!(
                instance_id = %instance.id,
                instance_url = %instance.url,
                algorithm = self.as_str(),
                candidates = candidates.len(),
                "Selected instance"
            );
        }
        selected
    }
}

impl FromStr for StrategyKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_name(s))
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct RoundRobin;

impl BalancingStrategy for RoundRobin {
    fn select<'a>(
        &self,
        candidates: &'a [ServiceInstance],
        cursor: &RotationCursor,
    ) -> Option<&'a ServiceInstance> {
        if candidates.is_empty() {
            return None;
        }

        let index = cursor.advance() % candidates.len();
        candidates.get(index)
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}

pub struct RandomSelection;

impl BalancingStrategy for RandomSelection {
    fn select<'a>(
        &self,
        candidates: &'a [ServiceInstance],
        _cursor: &RotationCursor,
    ) -> Option<&'a ServiceInstance> {
        if candidates.is_empty() {
            return None;
        }

        let index = rand::thread_rng().gen_range(0..candidates.len());
        candidates.get(index)
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

pub struct LeastConnections;

impl BalancingStrategy for LeastConnections {
    fn select<'a>(
        &self,
        candidates: &'a [ServiceInstance],
        _cursor: &RotationCursor,
    ) -> Option<&'a ServiceInstance> {
        // Strict comparison keeps the earliest instance on ties
        let mut best: Option<&ServiceInstance> = None;
        for instance in candidates {
            match best {
                Some(current) if instance.connections >= current.connections => {}
                _ => best = Some(instance),
            }
        }
        best
    }

    fn name(&self) -> &'static str {
        "least-connections"
    }
}

pub struct WeightedRandom;

impl BalancingStrategy for WeightedRandom {
    fn select<'a>(
        &self,
        candidates: &'a [ServiceInstance],
        _cursor: &RotationCursor,
    ) -> Option<&'a ServiceInstance> {
        if candidates.is_empty() {
            return None;
        }

        let total_weight: u64 = candidates.iter().map(|i| u64::from(i.weight)).sum();
        if total_weight == 0 {
            return candidates.first();
        }

        let mut point = rand::thread_rng().gen_range(0..total_weight);
        for instance in candidates {
            let weight = u64::from(instance.weight);
            if point < weight {
                return Some(instance);
            }
            point -= weight;
        }

        candidates.last()
    }

    fn name(&self) -> &'static str {
        "weighted"
    }
}

pub struct FirstHealthy;

impl BalancingStrategy for FirstHealthy {
    fn select<'a>(
        &self,
        candidates: &'a [ServiceInstance],
        _cursor: &RotationCursor,
    ) -> Option<&'a ServiceInstance> {
        candidates.first()
    }

    fn name(&self) -> &'static str {
        "first-healthy"
    }
}
