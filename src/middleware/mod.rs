//! Request-intercepting middleware.

pub mod rate_limiting;

pub use rate_limiting::{
    client_identifier, rate_limit, LimitClass, LimitScope, RateLimitDecision, RateLimitState, RateLimiter,
};
