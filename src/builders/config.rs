//! Configuration Builder
//!
//! Fluent builder for [`ClientConfig`] with validation.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{UpstreamError, UpstreamResult};
use crate::resilience::{EndpointLimits, RateLimitHeaderNames};
use crate::types::{ClientConfig, PollerConfig, RateLimitMode};

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Creates a builder seeded with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default request rate.
    pub fn calls_per_second(mut self, rate: f64) -> Self {
        self.config.rate_limiter.calls_per_second = rate;
        self
    }

    /// Sets the default burst size.
    pub fn burst_size(mut self, burst: u32) -> Self {
        self.config.rate_limiter.burst_size = burst;
        self
    }

    /// Sets the initial token allowance.
    pub fn initial_allowance(mut self, allowance: f64) -> Self {
        self.config.rate_limiter.initial_allowance = Some(allowance);
        self
    }

    /// Sets the quota header names.
    pub fn rate_limit_headers(mut self, headers: RateLimitHeaderNames) -> Self {
        self.config.rate_limit_headers = headers;
        self
    }

    /// Sets the rate limit mode.
    pub fn rate_limit_mode(mut self, mode: RateLimitMode) -> Self {
        self.config.rate_limit_mode = mode;
        self
    }

    /// Adds a per-endpoint rate limit.
    pub fn endpoint_limit(mut self, pattern: impl Into<String>, limits: EndpointLimits) -> Self {
        self.config.endpoint_limits.push((pattern.into(), limits));
        self
    }

    /// Sets the circuit breaker failure threshold.
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.circuit_breaker.failure_threshold = threshold;
        self
    }

    /// Sets the circuit breaker open timeout.
    pub fn circuit_timeout(mut self, timeout: Duration) -> Self {
        self.config.circuit_breaker.timeout = timeout;
        self
    }

    /// Sets total attempts per call.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    /// Sets the base retry delay.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.retry.base_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.config.retry.backoff_factor = factor;
        self
    }

    /// Sets the maximum retry delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.retry.max_delay = delay;
        self
    }

    /// Sets the jitter multiplier range.
    pub fn jitter(mut self, min: f64, max: f64) -> Self {
        self.config.retry.min_jitter = min;
        self.config.retry.max_jitter = max;
        self
    }

    /// Sets the retryable HTTP statuses.
    pub fn retryable_statuses(mut self, statuses: impl Into<Vec<u16>>) -> Self {
        self.config.retry.retryable_statuses = statuses.into();
        self
    }

    /// Replaces the poller configuration.
    pub fn poller(mut self, poller: PollerConfig) -> Self {
        self.config.poller = poller;
        self
    }

    /// Sets the poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poller.poll_interval = interval;
        self
    }

    /// Sets the maximum time to wait for an async operation.
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.config.poller.max_wait = max_wait;
        self
    }

    /// Sets the token safety margin.
    pub fn token_safety_margin(mut self, margin: Duration) -> Self {
        self.config.token_cache.safety_margin = margin;
        self
    }

    /// Sets the per-call deadline.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    /// Sets the user agent.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Adds a default header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.default_headers.insert(name.into(), value.into());
        self
    }

    /// Apply `UPSTREAM_*` variables resolved by `lookup` on top of defaults.
    pub fn from_lookup<F>(lookup: F) -> UpstreamResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::new();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("UPSTREAM_CALLS_PER_SECOND") {
            builder = builder.calls_per_second(parse_var("UPSTREAM_CALLS_PER_SECOND", &v)?);
        }
        if let Some(v) = get("UPSTREAM_BURST_SIZE") {
            builder = builder.burst_size(parse_var("UPSTREAM_BURST_SIZE", &v)?);
        }
        if let Some(v) = get("UPSTREAM_RATE_LIMIT_MODE") {
            let mode = match v.trim().to_ascii_lowercase().as_str() {
                "block" => RateLimitMode::Block,
                "fail_fast" | "failfast" => RateLimitMode::FailFast,
                other => {
                    return Err(UpstreamError::configuration(format!(
                        "UPSTREAM_RATE_LIMIT_MODE must be block or fail_fast, got {}",
                        other
                    )))
                }
            };
            builder = builder.rate_limit_mode(mode);
        }
        if let Some(v) = get("UPSTREAM_FAILURE_THRESHOLD") {
            builder = builder.failure_threshold(parse_var("UPSTREAM_FAILURE_THRESHOLD", &v)?);
        }
        if let Some(v) = get("UPSTREAM_CIRCUIT_TIMEOUT_SECS") {
            builder = builder.circuit_timeout(secs_var("UPSTREAM_CIRCUIT_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("UPSTREAM_MAX_ATTEMPTS") {
            builder = builder.max_attempts(parse_var("UPSTREAM_MAX_ATTEMPTS", &v)?);
        }
        if let Some(v) = get("UPSTREAM_BASE_DELAY_MS") {
            builder = builder.base_delay(Duration::from_millis(parse_var(
                "UPSTREAM_BASE_DELAY_MS",
                &v,
            )?));
        }
        if let Some(v) = get("UPSTREAM_BACKOFF_FACTOR") {
            builder = builder.backoff_factor(parse_var("UPSTREAM_BACKOFF_FACTOR", &v)?);
        }
        if let Some(v) = get("UPSTREAM_MAX_DELAY_SECS") {
            builder = builder.max_delay(secs_var("UPSTREAM_MAX_DELAY_SECS", &v)?);
        }
        if let Some(v) = get("UPSTREAM_MIN_JITTER") {
            builder.config.retry.min_jitter = parse_var("UPSTREAM_MIN_JITTER", &v)?;
        }
        if let Some(v) = get("UPSTREAM_MAX_JITTER") {
            builder.config.retry.max_jitter = parse_var("UPSTREAM_MAX_JITTER", &v)?;
        }
        if let Some(v) = get("UPSTREAM_POLL_INTERVAL_SECS") {
            builder = builder.poll_interval(secs_var("UPSTREAM_POLL_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = get("UPSTREAM_MAX_WAIT_SECS") {
            builder = builder.max_wait(secs_var("UPSTREAM_MAX_WAIT_SECS", &v)?);
        }
        if let Some(v) = get("UPSTREAM_TOKEN_SAFETY_MARGIN_SECS") {
            builder =
                builder.token_safety_margin(secs_var("UPSTREAM_TOKEN_SAFETY_MARGIN_SECS", &v)?);
        }
        if let Some(v) = get("UPSTREAM_CALL_TIMEOUT_SECS") {
            builder = builder.call_timeout(secs_var("UPSTREAM_CALL_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("UPSTREAM_USER_AGENT") {
            builder = builder.user_agent(v);
        }

        Ok(builder)
    }

    /// Validates and builds the configuration.
    pub fn build(self) -> UpstreamResult<ClientConfig> {
        let config = self.config;

        if !is_positive(config.rate_limiter.calls_per_second) {
            return Err(UpstreamError::configuration(
                "calls_per_second must be a positive number",
            ));
        }
        if config.rate_limiter.burst_size == 0 {
            return Err(UpstreamError::configuration("burst_size must be at least 1"));
        }
        for (pattern, limits) in &config.endpoint_limits {
            if !is_positive(limits.calls_per_second) || limits.burst_size == 0 {
                return Err(UpstreamError::configuration(format!(
                    "Invalid rate limit for endpoint {}",
                    pattern
                )));
            }
        }
        if config.circuit_breaker.failure_threshold == 0 {
            return Err(UpstreamError::configuration(
                "failure_threshold must be at least 1",
            ));
        }
        if config.retry.max_attempts == 0 {
            return Err(UpstreamError::configuration("max_attempts must be at least 1"));
        }
        if !is_positive(config.retry.backoff_factor) {
            return Err(UpstreamError::configuration(
                "backoff_factor must be a positive number",
            ));
        }
        let (min_jitter, max_jitter) = (config.retry.min_jitter, config.retry.max_jitter);
        if !is_positive(min_jitter) || !max_jitter.is_finite() || min_jitter > max_jitter {
            return Err(UpstreamError::configuration(format!(
                "Invalid jitter range {}..{}",
                min_jitter, max_jitter
            )));
        }
        if config.poller.poll_interval.is_zero() {
            return Err(UpstreamError::configuration("poll_interval must be non-zero"));
        }
        if config.call_timeout.is_zero() {
            return Err(UpstreamError::configuration("call_timeout must be non-zero"));
        }
        if config.user_agent.trim().is_empty() {
            return Err(UpstreamError::configuration("user_agent cannot be empty"));
        }

        Ok(config)
    }
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> UpstreamResult<T> {
    value.trim().parse().map_err(|_| {
        UpstreamError::configuration(format!("{} has an invalid value: {}", name, value))
    })
}

fn secs_var(name: &str, value: &str) -> UpstreamResult<Duration> {
    let secs: f64 = parse_var(name, value)?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(UpstreamError::configuration(format!(
            "{} must be a non-negative number of seconds",
            name
        )));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Creates a new configuration builder.
pub fn client_config() -> ClientConfigBuilder {
    ClientConfigBuilder::new()
}
