//! Resilience primitives: per-tier circuit breakers guarding LLM calls.

mod breaker;

pub use breaker::{BreakerConfig, BreakerMetrics, BreakerRegistry, BreakerState, CircuitBreaker};
