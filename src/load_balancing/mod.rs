pub mod strategies;

pub use strategies::{
    BalancingStrategy, FirstHealthy, LeastConnections, RandomSelection, RotationCursor, RoundRobin,
    StrategyKind, WeightedRandom,
};
