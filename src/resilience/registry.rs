//! Registries
//!
//! Per-destination rate limiters and circuit breakers. Registries are plain
//! values owned by whoever builds the executor, so independent executors
//! (and tests) never share state by accident.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitStats};
use crate::resilience::rate_limiter::{RateLimitHeaderNames, RateLimiter, RateLimiterConfig};
use crate::telemetry::{NoOpSink, SharedSink};

/// Destination key for a URL: its host, plus the port when one is explicit.
pub fn destination_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    }
}

/// Rate limit override for matching endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointLimits {
    pub calls_per_second: f64,
    pub burst_size: u32,
    /// Endpoints naming the same pool share one limiter.
    pub shared_pool: Option<String>,
}

impl EndpointLimits {
    /// Limits for a single endpoint.
    pub fn new(calls_per_second: f64, burst_size: u32) -> Self {
        Self {
            calls_per_second,
            burst_size,
            shared_pool: None,
        }
    }

    /// Share the limiter with every endpoint in `pool`.
    pub fn in_pool(mut self, pool: impl Into<String>) -> Self {
        self.shared_pool = Some(pool.into());
        self
    }
}

/// Rate limiters keyed by destination or shared pool.
pub struct RateLimiterRegistry {
    defaults: RateLimiterConfig,
    header_names: RateLimitHeaderNames,
    sink: SharedSink,
    // Registration order decides which pattern wins.
    endpoints: Mutex<Vec<(String, EndpointLimits)>>,
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl RateLimiterRegistry {
    /// Create a registry using `defaults` for unconfigured destinations.
    pub fn new(defaults: RateLimiterConfig) -> Self {
        Self {
            defaults,
            header_names: RateLimitHeaderNames::default(),
            sink: Arc::new(NoOpSink),
            endpoints: Mutex::new(Vec::new()),
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Use custom quota header names for every limiter.
    pub fn with_header_names(mut self, header_names: RateLimitHeaderNames) -> Self {
        self.header_names = header_names;
        self
    }

    /// Route limiter events to `sink`.
    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Register limits for URLs whose host equals `pattern` or whose text
    /// contains it. Takes effect for limiters created afterwards.
    pub fn configure_endpoint(&self, pattern: impl Into<String>, limits: EndpointLimits) {
        let pattern = pattern.into();
        debug!(
            pattern = %pattern,
            calls_per_second = limits.calls_per_second,
            burst_size = limits.burst_size,
            shared_pool = ?limits.shared_pool,
            "Configured endpoint rate limit"
        );
        self.endpoints.lock().push((pattern, limits));
    }

    /// Limiter responsible for `url`.
    pub fn for_url(&self, url: &Url) -> Arc<RateLimiter> {
        let destination = destination_key(url);
        let matched = self
            .endpoints
            .lock()
            .iter()
            .find(|(pattern, _)| {
                pattern.eq_ignore_ascii_case(&destination)
                    || url.as_str().contains(pattern.as_str())
            })
            .map(|(_, limits)| limits.clone());

        match matched {
            Some(limits) => {
                let key = limits
                    .shared_pool
                    .clone()
                    .unwrap_or_else(|| destination.clone());
                let config = RateLimiterConfig::new(limits.calls_per_second, limits.burst_size);
                self.get_or_create(&key, config)
            }
            None => self.get_or_create(&destination, self.defaults.clone()),
        }
    }

    /// Limiter for an explicit key, created with the default config.
    pub fn get(&self, key: &str) -> Arc<RateLimiter> {
        self.get_or_create(key, self.defaults.clone())
    }

    /// Number of live limiters.
    pub fn len(&self) -> usize {
        self.limiters.lock().len()
    }

    /// Whether no limiter was created yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get_or_create(&self, key: &str, config: RateLimiterConfig) -> Arc<RateLimiter> {
        self.limiters
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(
                    RateLimiter::new(key, config)
                        .with_header_names(self.header_names.clone())
                        .with_sink(self.sink.clone()),
                )
            })
            .clone()
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

/// Circuit breakers keyed by destination.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    sink: SharedSink,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry; every breaker uses `config`.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            sink: Arc::new(NoOpSink),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Route breaker events to `sink`.
    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Breaker for `destination`.
    pub fn get(&self, destination: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(destination.to_string())
            .or_insert_with(|| {
                Arc::new(
                    CircuitBreaker::new(destination, self.config.clone())
                        .with_sink(self.sink.clone()),
                )
            })
            .clone()
    }

    /// Statistics for every known destination.
    pub fn stats(&self) -> HashMap<String, CircuitStats> {
        let breakers: Vec<_> = self.breakers.lock().values().cloned().collect();
        breakers
            .into_iter()
            .map(|b| (b.destination().to_string(), b.stats()))
            .collect()
    }

    /// Emit a statistics event for every known destination.
    pub fn emit_statistics(&self) {
        let breakers: Vec<_> = self.breakers.lock().values().cloned().collect();
        for breaker in breakers {
            breaker.emit_statistics();
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
