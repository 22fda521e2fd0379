//! Resilience layer: a rolling-window circuit breaker and the limiter
//! wrapper that uses it to fall back to in-process counting.

mod breaker;
mod guard;

pub use breaker::{
    BreakerConfig, BreakerEvent, BreakerMetrics, CircuitBreaker, CircuitState, Permit,
    SharedCircuitBreaker,
};
pub use guard::ResilientLimiter;
