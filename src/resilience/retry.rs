//! Retry Logic
//!
//! Exponential backoff with multiplicative jitter. A server-supplied
//! `Retry-After` always wins over the computed backoff.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{UpstreamError, UpstreamResult};

/// Retry configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Backoff multiplier.
    pub backoff_factor: f64,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    /// Lower jitter multiplier.
    pub min_jitter: f64,
    /// Upper jitter multiplier.
    pub max_jitter: f64,
    /// HTTP statuses treated as transient.
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
            min_jitter: 0.8,
            max_jitter: 1.2,
            retryable_statuses: vec![429, 503],
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets total attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the jitter range.
    pub fn with_jitter(mut self, min: f64, max: f64) -> Self {
        self.min_jitter = min;
        self.max_jitter = max;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(self) -> Self {
        self.with_jitter(1.0, 1.0)
    }

    /// Sets the retryable HTTP statuses.
    pub fn with_retryable_statuses(mut self, statuses: impl Into<Vec<u16>>) -> Self {
        self.retryable_statuses = statuses.into();
        self
    }
}

/// Retry decisions for one call at a time. Stateless; the attempt counter
/// lives with the caller.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Creates a new retry policy.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Total attempts allowed.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Whether an HTTP status is transient.
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.config.retryable_statuses.contains(&status)
    }

    /// Whether attempt number `attempt` (1-based) that failed with `error`
    /// should be followed by another attempt.
    pub fn should_retry(&self, attempt: u32, error: &UpstreamError) -> bool {
        attempt < self.config.max_attempts && error.is_retryable()
    }

    /// Backoff before the attempt following `attempt`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.config.base_delay.as_secs_f64() * self.config.backoff_factor.powi(exponent);
        let capped = secs.min(self.config.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Jittered backoff before the attempt following `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff(attempt).mul_f64(self.jitter_factor())
    }

    /// Delay after `attempt` failed with `error`; `Retry-After` wins.
    pub fn delay_for_error(&self, attempt: u32, error: &UpstreamError) -> Duration {
        error
            .retry_after()
            .unwrap_or_else(|| self.delay_for(attempt))
    }

    fn jitter_factor(&self) -> f64 {
        let (min, max) = (self.config.min_jitter, self.config.max_jitter);
        if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        }
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or attempts run out.
    ///
    /// Exhaustion is reported as [`UpstreamError::OperationFailed`] carrying
    /// the last error; non-retryable errors are returned unchanged.
    pub async fn execute<T, F, Fut>(&self, destination: &str, mut operation: F) -> UpstreamResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = UpstreamResult<T>>,
    {
        let mut attempt = 1;
        loop {
            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_retryable() {
                return Err(error);
            }

            if !self.should_retry(attempt, &error) {
                return Err(UpstreamError::OperationFailed {
                    destination: destination.to_string(),
                    attempts: attempt,
                    last_status: error.status_code(),
                    message: "retries exhausted".to_string(),
                    source: Some(Box::new(error)),
                });
            }

            let delay = self.delay_for_error(attempt, &error);
            warn!(
                destination = %destination,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after transient failure"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }

    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
