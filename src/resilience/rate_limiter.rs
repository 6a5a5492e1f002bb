//! Rate Limiter
//!
//! Token bucket limiter for one destination whose refill rate follows the
//! quota the server reports in its rate-limit headers.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::resilience::retry::parse_retry_after;
use crate::telemetry::{NoOpSink, SharedSink, TelemetryEvent};

// Absorbs floating point drift after sleeping exactly the computed wait.
const EPSILON: f64 = 1e-9;

// Reset header values at or above this are Unix timestamps, below are deltas.
const EPOCH_THRESHOLD: f64 = 1_000_000_000.0;

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// Sustained calls per second.
    pub calls_per_second: f64,
    /// Maximum accumulated tokens.
    pub burst_size: u32,
    /// Tokens available at start. Defaults to `min(1, burst_size)`.
    pub initial_allowance: Option<f64>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            calls_per_second: 10.0,
            burst_size: 1,
            initial_allowance: None,
        }
    }
}

impl RateLimiterConfig {
    /// Config with the given rate and burst.
    pub fn new(calls_per_second: f64, burst_size: u32) -> Self {
        Self {
            calls_per_second,
            burst_size,
            initial_allowance: None,
        }
    }

    /// Sets the initial allowance.
    pub fn with_initial_allowance(mut self, allowance: f64) -> Self {
        self.initial_allowance = Some(allowance);
        self
    }
}

/// Names of the quota headers consulted by [`RateLimiter::adapt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaderNames {
    pub limit: String,
    pub remaining: String,
    pub reset: String,
    pub retry_after: String,
}

impl Default for RateLimitHeaderNames {
    fn default() -> Self {
        Self {
            limit: "X-RateLimit-Limit".to_string(),
            remaining: "X-RateLimit-Remaining".to_string(),
            reset: "X-RateLimit-Reset".to_string(),
            retry_after: "Retry-After".to_string(),
        }
    }
}

/// Adjustment band selected from the remaining quota fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateTier {
    /// Under 5% remaining.
    Critical,
    /// Under 10% remaining.
    Low,
    /// Under 25% remaining.
    Moderate,
    /// Over 75% remaining.
    Healthy,
    /// The provider's quota window has reset.
    Reset,
}

impl RateTier {
    /// Tier for a remaining fraction; `None` inside the 25%-75% dead zone.
    pub fn for_fraction(fraction: f64) -> Option<Self> {
        if fraction < 0.05 {
            Some(Self::Critical)
        } else if fraction < 0.10 {
            Some(Self::Low)
        } else if fraction < 0.25 {
            Some(Self::Moderate)
        } else if fraction > 0.75 {
            Some(Self::Healthy)
        } else {
            None
        }
    }

    /// Whether the tier signals the quota is nearly exhausted.
    pub fn is_emergency(&self) -> bool {
        matches!(self, Self::Critical | Self::Low)
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::Healthy => "healthy",
            Self::Reset => "reset",
        }
    }
}

impl std::fmt::Display for RateTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate limiter statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterStats {
    pub rate: f64,
    pub original_rate: f64,
    pub burst_capacity: f64,
    pub allowance: f64,
    pub total_acquired: u64,
    /// Acquisitions that had to sleep.
    pub total_waited: u64,
    pub total_wait_time: Duration,
}

struct BucketState {
    rate: f64,
    allowance: f64,
    last_check: Instant,
    // Pending quota window reset announced by the server.
    reset_at: Option<Instant>,
    total_acquired: u64,
    total_waited: u64,
    total_wait_time: Duration,
}

/// Adaptive token bucket for one destination.
pub struct RateLimiter {
    destination: String,
    original_rate: f64,
    burst_capacity: f64,
    headers: RateLimitHeaderNames,
    state: Mutex<BucketState>,
    sink: SharedSink,
}

impl RateLimiter {
    /// Create new rate limiter. Non-positive rates fall back to the default
    /// rate and the burst is at least one token.
    pub fn new(destination: impl Into<String>, config: RateLimiterConfig) -> Self {
        let rate = if config.calls_per_second.is_finite() && config.calls_per_second > 0.0 {
            config.calls_per_second
        } else {
            RateLimiterConfig::default().calls_per_second
        };
        let burst_capacity = config.burst_size.max(1) as f64;
        let allowance = config
            .initial_allowance
            .unwrap_or(1.0)
            .clamp(0.0, burst_capacity);

        Self {
            destination: destination.into(),
            original_rate: rate,
            burst_capacity,
            headers: RateLimitHeaderNames::default(),
            state: Mutex::new(BucketState {
                rate,
                allowance,
                last_check: Instant::now(),
                reset_at: None,
                total_acquired: 0,
                total_waited: 0,
                total_wait_time: Duration::ZERO,
            }),
            sink: Arc::new(NoOpSink),
        }
    }

    /// Use custom quota header names.
    pub fn with_header_names(mut self, headers: RateLimitHeaderNames) -> Self {
        self.headers = headers;
        self
    }

    /// Route rate adjustment events to `sink`.
    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Destination this limiter paces.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Current refill rate in tokens per second.
    pub fn rate(&self) -> f64 {
        self.state.lock().rate
    }

    /// Configured refill rate.
    pub fn original_rate(&self) -> f64 {
        self.original_rate
    }

    /// Wait until a token is available and consume it.
    pub async fn acquire(&self) {
        let started = Instant::now();
        let mut waited = false;

        loop {
            let (wait, event) = {
                let mut st = self.state.lock();
                let event = self.refill(&mut st, Instant::now());

                if st.allowance >= 1.0 - EPSILON {
                    st.allowance = (st.allowance - 1.0).max(0.0);
                    st.total_acquired += 1;
                    if waited {
                        st.total_waited += 1;
                        st.total_wait_time += started.elapsed();
                    }
                    debug!(
                        destination = %self.destination,
                        allowance = st.allowance,
                        "Consumed rate limit token"
                    );
                    (None, event)
                } else {
                    let secs = (1.0 - st.allowance) / st.rate;
                    (Some(Duration::from_secs_f64(secs)), event)
                }
            };

            if let Some(event) = event {
                self.sink.emit(&event);
            }

            match wait {
                None => return,
                Some(wait) => {
                    waited = true;
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Consume a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let (acquired, event) = {
            let mut st = self.state.lock();
            let event = self.refill(&mut st, Instant::now());
            if st.allowance >= 1.0 - EPSILON {
                st.allowance = (st.allowance - 1.0).max(0.0);
                st.total_acquired += 1;
                (true, event)
            } else {
                (false, event)
            }
        };

        if let Some(event) = event {
            self.sink.emit(&event);
        }
        acquired
    }

    /// Adjust the refill rate from response headers. Malformed values are
    /// logged and ignored.
    pub fn adapt(&self, headers: &HashMap<String, String>) {
        if let Some(raw) = find_header(headers, &self.headers.retry_after) {
            match parse_retry_after(raw) {
                Some(delay) => debug!(
                    destination = %self.destination,
                    retry_after_ms = delay.as_millis() as u64,
                    "Server requested retry delay"
                ),
                None => warn!(
                    destination = %self.destination,
                    value = raw,
                    "Ignoring malformed Retry-After header"
                ),
            }
        }

        let fraction = self.remaining_fraction(headers);
        let reset = find_header(headers, &self.headers.reset).and_then(|raw| {
            let parsed = parse_reset(raw);
            if parsed.is_none() {
                warn!(
                    destination = %self.destination,
                    value = raw,
                    "Ignoring malformed rate limit reset header"
                );
            }
            parsed
        });

        if fraction.is_none() && reset.is_none() {
            return;
        }

        let mut events = Vec::new();
        {
            let mut st = self.state.lock();
            let now = Instant::now();
            if let Some(event) = self.refill(&mut st, now) {
                events.push(event);
            }

            if let Some(fraction) = fraction {
                if let Some(tier) = RateTier::for_fraction(fraction) {
                    let previous = st.rate;
                    let new_rate = self.rate_for(tier, previous);
                    if (new_rate - previous).abs() > EPSILON {
                        st.rate = new_rate;
                        events.push(self.adjusted(previous, new_rate, Some(fraction), tier));
                    }
                } else {
                    debug!(
                        destination = %self.destination,
                        remaining_fraction = fraction,
                        rate = st.rate,
                        "Rate limit stable"
                    );
                }
            }

            match reset {
                Some(until) if until.is_zero() => {
                    st.reset_at = None;
                    if let Some(event) = self.restore(&mut st) {
                        events.push(event);
                    }
                }
                Some(until) => st.reset_at = now.checked_add(until),
                None => {}
            }
        }

        for event in &events {
            self.sink.emit(event);
        }
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> RateLimiterStats {
        let (stats, event) = {
            let mut st = self.state.lock();
            let event = self.refill(&mut st, Instant::now());
            let stats = RateLimiterStats {
                rate: st.rate,
                original_rate: self.original_rate,
                burst_capacity: self.burst_capacity,
                allowance: st.allowance,
                total_acquired: st.total_acquired,
                total_waited: st.total_waited,
                total_wait_time: st.total_wait_time,
            };
            (stats, event)
        };

        if let Some(event) = event {
            self.sink.emit(&event);
        }
        stats
    }

    fn remaining_fraction(&self, headers: &HashMap<String, String>) -> Option<f64> {
        let limit = find_header(headers, &self.headers.limit)?;
        let remaining = find_header(headers, &self.headers.remaining)?;

        match (limit.trim().parse::<f64>(), remaining.trim().parse::<f64>()) {
            (Ok(limit), Ok(remaining)) if limit.is_finite() && remaining.is_finite() => {
                Some(if limit > 0.0 { remaining / limit } else { 1.0 })
            }
            _ => {
                warn!(
                    destination = %self.destination,
                    limit,
                    remaining,
                    "Ignoring malformed rate limit headers"
                );
                None
            }
        }
    }

    fn rate_for(&self, tier: RateTier, current: f64) -> f64 {
        let (factor, floor) = match tier {
            RateTier::Critical => (0.3, 0.1),
            RateTier::Low => (0.5, 0.5),
            RateTier::Moderate => (0.75, 1.0),
            // Step toward the configured rate by a quarter of it per signal.
            RateTier::Healthy => {
                return (current + 0.25 * self.original_rate).min(self.original_rate);
            }
            RateTier::Reset => return self.original_rate,
        };

        // Never speed up while slowing down, even when the floor is above the
        // current rate.
        (current * factor).max(floor).min(current)
    }

    fn refill(&self, st: &mut BucketState, now: Instant) -> Option<TelemetryEvent> {
        let elapsed = now.saturating_duration_since(st.last_check).as_secs_f64();
        st.allowance = (st.allowance + elapsed * st.rate).clamp(0.0, self.burst_capacity);
        st.last_check = now;

        match st.reset_at {
            Some(at) if now >= at => {
                st.reset_at = None;
                self.restore(st)
            }
            _ => None,
        }
    }

    fn restore(&self, st: &mut BucketState) -> Option<TelemetryEvent> {
        let previous = st.rate;
        if (previous - self.original_rate).abs() <= EPSILON {
            return None;
        }
        st.rate = self.original_rate;
        Some(self.adjusted(previous, self.original_rate, None, RateTier::Reset))
    }

    fn adjusted(
        &self,
        previous_rate: f64,
        new_rate: f64,
        remaining_fraction: Option<f64>,
        tier: RateTier,
    ) -> TelemetryEvent {
        TelemetryEvent::RateAdjusted {
            destination: self.destination.clone(),
            previous_rate,
            new_rate,
            remaining_fraction,
            tier,
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("destination", &self.destination)
            .field("rate", &self.rate())
            .field("original_rate", &self.original_rate)
            .field("burst_capacity", &self.burst_capacity)
            .finish()
    }
}

fn find_header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Time until the quota window resets. Accepts a Unix timestamp in seconds
/// or delta-seconds; an elapsed reset yields `Duration::ZERO`.
fn parse_reset(value: &str) -> Option<Duration> {
    let value: f64 = value.trim().parse().ok()?;
    if !value.is_finite() {
        return None;
    }

    let until = if value >= EPOCH_THRESHOLD {
        value - chrono::Utc::now().timestamp_millis() as f64 / 1000.0
    } else {
        value
    };
    Duration::try_from_secs_f64(until.max(0.0)).ok()
}
