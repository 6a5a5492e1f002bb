//! Configuration Types
//!
//! Static tuning parameters for the client core. Configuration is read once
//! when an executor is built and never re-read while calls are in flight.

use std::collections::HashMap;
use std::time::Duration;

use crate::builders::ClientConfigBuilder;
use crate::error::UpstreamResult;
use crate::resilience::{
    CircuitBreakerConfig, EndpointLimits, RateLimitHeaderNames, RateLimiterConfig, RetryConfig,
};

/// Default overall deadline for one call including retries.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Default `User-Agent` header.
pub const DEFAULT_USER_AGENT: &str = concat!("upstream-client/", env!("CARGO_PKG_VERSION"));

/// Behaviour when no rate limit token is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitMode {
    /// Wait for a token.
    #[default]
    Block,
    /// Fail with `RateLimitExceeded`.
    FailFast,
}

/// Asynchronous operation polling configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    /// Delay between polls unless the server sends `Retry-After`.
    pub poll_interval: Duration,
    /// Time after which the client stops waiting.
    pub max_wait: Duration,
    /// Body field holding the operation status.
    pub status_field: String,
    /// Status values that mean the operation completed.
    pub success_values: Vec<String>,
    /// Status values that mean the operation failed.
    pub failure_values: Vec<String>,
    /// Status values that mean the operation is still running.
    pub in_progress_values: Vec<String>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        fn values(list: &[&str]) -> Vec<String> {
            list.iter().map(|s| s.to_string()).collect()
        }

        Self {
            poll_interval: Duration::from_secs(1),
            max_wait: Duration::from_secs(300),
            status_field: "status".to_string(),
            success_values: values(&["succeeded", "success", "completed", "complete", "done"]),
            failure_values: values(&["failed", "failure", "error", "cancelled", "canceled"]),
            in_progress_values: values(&[
                "notstarted",
                "not_started",
                "pending",
                "queued",
                "accepted",
                "running",
                "inprogress",
                "in_progress",
                "processing",
            ]),
        }
    }
}

impl PollerConfig {
    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the maximum wait.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Sets the status field name.
    pub fn with_status_field(mut self, field: impl Into<String>) -> Self {
        self.status_field = field.into();
        self
    }
}

/// Token cache configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenCacheConfig {
    /// Tokens are not reused within this margin of their expiry.
    pub safety_margin: Duration,
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            safety_margin: Duration::from_secs(60),
        }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub rate_limiter: RateLimiterConfig,
    pub rate_limit_headers: RateLimitHeaderNames,
    pub rate_limit_mode: RateLimitMode,
    /// Per-endpoint overrides, matched in order.
    pub endpoint_limits: Vec<(String, EndpointLimits)>,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub poller: PollerConfig,
    pub token_cache: TokenCacheConfig,
    /// Deadline for one call including retries.
    pub call_timeout: Duration,
    pub user_agent: String,
    /// Headers added to every request unless the caller sets them.
    pub default_headers: HashMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rate_limiter: RateLimiterConfig::default(),
            rate_limit_headers: RateLimitHeaderNames::default(),
            rate_limit_mode: RateLimitMode::default(),
            endpoint_limits: Vec::new(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            poller: PollerConfig::default(),
            token_cache: TokenCacheConfig::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            default_headers: HashMap::new(),
        }
    }
}

impl ClientConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Creates a configuration from environment variables on top of the
    /// defaults.
    ///
    /// # Environment Variables
    ///
    /// - `UPSTREAM_CALLS_PER_SECOND`, `UPSTREAM_BURST_SIZE`
    /// - `UPSTREAM_RATE_LIMIT_MODE` (`block` or `fail_fast`)
    /// - `UPSTREAM_FAILURE_THRESHOLD`, `UPSTREAM_CIRCUIT_TIMEOUT_SECS`
    /// - `UPSTREAM_MAX_ATTEMPTS`, `UPSTREAM_BASE_DELAY_MS`, `UPSTREAM_BACKOFF_FACTOR`,
    ///   `UPSTREAM_MAX_DELAY_SECS`, `UPSTREAM_MIN_JITTER`, `UPSTREAM_MAX_JITTER`
    /// - `UPSTREAM_POLL_INTERVAL_SECS`, `UPSTREAM_MAX_WAIT_SECS`
    /// - `UPSTREAM_TOKEN_SAFETY_MARGIN_SECS`, `UPSTREAM_CALL_TIMEOUT_SECS`
    /// - `UPSTREAM_USER_AGENT`
    pub fn from_env() -> UpstreamResult<Self> {
        ClientConfigBuilder::from_lookup(|name| std::env::var(name).ok())?.build()
    }
}
