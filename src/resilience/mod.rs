//! Resilience
//!
//! Resilience patterns for outbound calls.
//!
//! - **Rate Limiter**: adaptive token bucket per destination
//! - **Circuit Breaker**: fast-fail for unhealthy destinations
//! - **Retry**: exponential backoff with jitter
//! - **Registries**: per-destination limiter and breaker maps

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod registry;
pub mod retry;

// Retry
pub use retry::{parse_retry_after, RetryConfig, RetryPolicy};

// Circuit Breaker
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats};

// Rate Limiter
pub use rate_limiter::{
    RateLimitHeaderNames, RateLimiter, RateLimiterConfig, RateLimiterStats, RateTier,
};

// Registries
pub use registry::{destination_key, CircuitBreakerRegistry, EndpointLimits, RateLimiterRegistry};
