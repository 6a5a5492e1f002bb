//! Upstream Client
//!
//! Resilient core for outbound calls to rate-limited, occasionally unhealthy
//! HTTP APIs.
//!
//! # Features
//!
//! - Adaptive token bucket rate limiting driven by `X-RateLimit-*` headers
//! - Per-destination circuit breakers (closed, open, half-open)
//! - Exponential backoff with jitter and `Retry-After` precedence
//! - Transparent completion of `202 Accepted` operations by polling
//! - Client-credentials bearer tokens with expiry-aware caching and
//!   coalescing of concurrent acquisitions
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use upstream_client::{
//!     client_config, ClientCredentials, ClientCredentialsAcquirer, ClientCredentialsConfig,
//!     ReqwestHttpTransport, RequestExecutor, TokenCache, TokenCacheConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = client_config()
//!         .calls_per_second(5.0)
//!         .failure_threshold(5)
//!         .max_attempts(3)
//!         .build()?;
//!
//!     let transport = Arc::new(ReqwestHttpTransport::new()?);
//!     let acquirer = ClientCredentialsAcquirer::new(
//!         ClientCredentialsConfig::new("https://login.example.com/{tenant}/oauth2/v2.0/token"),
//!         transport.clone(),
//!     );
//!     let tokens = Arc::new(TokenCache::new(Arc::new(acquirer), TokenCacheConfig::default()));
//!     let credentials = ClientCredentials::new("tenant", "client", "secret", "api://default");
//!
//!     let executor = RequestExecutor::builder(transport)
//!         .config(config)
//!         .token_cache(tokens, credentials)
//!         .build();
//!
//!     let response = executor.get("https://api.example.com/v1/items", true).await?;
//!     println!("{}", response.text());
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - `types`: configuration, credential, token and response types
//! - `error`: error taxonomy surfaced to callers
//! - `core`: HTTP transport seam
//! - `resilience`: rate limiter, circuit breaker, retry policy and registries
//! - `token`: token acquisition and caching
//! - `polling`: async operation poller
//! - `telemetry`: events, metrics and logging setup
//! - `builders`: fluent configuration builder
//! - `executor`: the request pipeline combining all of the above

pub mod builders;
pub mod core;
pub mod error;
pub mod executor;
pub mod polling;
pub mod resilience;
pub mod telemetry;
pub mod token;
pub mod types;

// Re-export executor
pub use executor::{RequestExecutor, RequestExecutorBuilder};

// Re-export builders
pub use builders::{client_config, ClientConfigBuilder};

// Re-export errors
pub use error::{
    get_user_message, TransportErrorKind, TransportFailure, UpstreamError, UpstreamResult,
};

// Re-export types
pub use types::{
    // Config
    ClientConfig, PollerConfig, RateLimitMode, TokenCacheConfig,
    // Credentials
    ClientAuthMethod, ClientCredentials, TokenKey,
    // Token
    AccessToken, TokenResponse,
    // Response
    AsyncOperationResult, UpstreamResponse,
};

// Re-export core components
pub use core::{
    HttpMethod, HttpRequest, HttpResponse, HttpTransport, MockHttpTransport,
    ReqwestHttpTransport,
};

// Re-export resilience
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, CircuitStats,
    EndpointLimits, RateLimitHeaderNames, RateLimiter, RateLimiterConfig, RateLimiterRegistry,
    RateTier, RetryConfig, RetryPolicy,
};

// Re-export token
pub use token::{ClientCredentialsAcquirer, ClientCredentialsConfig, TokenAcquirer, TokenCache};

// Re-export polling
pub use polling::{AsyncOperation, AsyncOperationPoller, PollOutcome};

// Re-export telemetry
pub use telemetry::{
    tracing_sink, ExecutorMetrics, InMemorySink, LogFormat, LogLevel, LoggingConfig,
    MetricsSnapshot, NoOpSink, SharedSink, TelemetryEvent, TelemetrySink, TracingSink,
};
