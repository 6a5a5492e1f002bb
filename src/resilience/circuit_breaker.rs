//! Circuit Breaker
//!
//! Per-destination failure tracking that fast-fails while a dependency is
//! unhealthy and probes it once the cooldown has passed.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::telemetry::{NoOpSink, SharedSink, TelemetryEvent};

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected without touching the network.
    Open,
    /// One probe request is allowed through.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe is admitted.
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Creates a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the open timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Read-only statistics snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    /// `total_failures / max(1, total_requests)`.
    pub failure_rate: f64,
    pub time_in_current_state: Duration,
    /// `None` until the first failure is recorded.
    pub time_since_last_failure: Option<Duration>,
    pub timeout: Duration,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_time: Option<Instant>,
    state_changed_at: Instant,
    total_requests: u64,
    total_failures: u64,
    // Set while a half-open probe is outstanding.
    probe_started_at: Option<Instant>,
}

/// Circuit breaker for one destination.
pub struct CircuitBreaker {
    destination: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    sink: SharedSink,
}

impl CircuitBreaker {
    /// Create new circuit breaker.
    pub fn new(destination: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            destination: destination.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_time: None,
                state_changed_at: Instant::now(),
                total_requests: 0,
                total_failures: 0,
                probe_started_at: None,
            }),
            sink: Arc::new(NoOpSink),
        }
    }

    /// Route state-change events to `sink`.
    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Destination this breaker guards.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check whether a request may proceed.
    ///
    /// An open circuit whose timeout has elapsed moves to half-open and
    /// admits exactly this caller as the probe.
    pub fn allow(&self) -> bool {
        let now = Instant::now();
        let (allowed, event) = {
            let mut st = self.state.lock();
            match st.state {
                CircuitState::Closed => (true, None),
                CircuitState::Open => {
                    if now.duration_since(st.state_changed_at) >= self.config.timeout {
                        let event =
                            self.transition(&mut st, CircuitState::HalfOpen, "timeout elapsed", now);
                        st.probe_started_at = Some(now);
                        (true, Some(event))
                    } else {
                        (false, None)
                    }
                }
                CircuitState::HalfOpen => {
                    let probe = st.probe_started_at;
                    match probe {
                        Some(started) if now.duration_since(started) < self.config.timeout => {
                            (false, None)
                        }
                        // The previous probe was never recorded; admit another.
                        _ => {
                            st.probe_started_at = Some(now);
                            (true, None)
                        }
                    }
                }
            }
        };

        if let Some(event) = event {
            self.sink.emit(&event);
        }
        allowed
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let now = Instant::now();
        let event = {
            let mut st = self.state.lock();
            st.total_requests += 1;
            match st.state {
                CircuitState::Closed => {
                    st.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    st.consecutive_failures = 0;
                    st.probe_started_at = None;
                    Some(self.transition(&mut st, CircuitState::Closed, "probe succeeded", now))
                }
                // A call admitted before the circuit opened; the circuit
                // stays open until its own probe succeeds.
                CircuitState::Open => None,
            }
        };

        if let Some(event) = event {
            self.sink.emit(&event);
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let event = {
            let mut st = self.state.lock();
            st.total_requests += 1;
            st.total_failures += 1;
            st.consecutive_failures = st.consecutive_failures.saturating_add(1);
            st.last_failure_time = Some(now);

            let tripped = st.consecutive_failures >= self.config.failure_threshold;
            match st.state {
                CircuitState::Closed if tripped => Some(self.transition(
                    &mut st,
                    CircuitState::Open,
                    "failure threshold reached",
                    now,
                )),
                CircuitState::HalfOpen => {
                    st.probe_started_at = None;
                    Some(self.transition(&mut st, CircuitState::Open, "probe failed", now))
                }
                _ => None,
            }
        };

        if let Some(event) = event {
            self.sink.emit(&event);
        }
    }

    /// Give back a half-open probe slot taken by [`allow`](Self::allow)
    /// when the call ended before reaching the destination. The state is
    /// left unchanged.
    pub fn release_probe(&self) {
        let mut st = self.state.lock();
        if st.state == CircuitState::HalfOpen {
            st.probe_started_at = None;
        }
    }

    /// Force the circuit closed. Lifetime totals are kept.
    pub fn reset(&self) {
        let now = Instant::now();
        let event = {
            let mut st = self.state.lock();
            st.consecutive_failures = 0;
            st.probe_started_at = None;
            if st.state == CircuitState::Closed {
                None
            } else {
                Some(self.transition(&mut st, CircuitState::Closed, "manual reset", now))
            }
        };

        if let Some(event) = event {
            self.sink.emit(&event);
        }
    }

    /// Current state, without triggering the open to half-open transition.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Time left before an open circuit admits a probe.
    pub fn retry_in(&self) -> Option<Duration> {
        let st = self.state.lock();
        match st.state {
            CircuitState::Open => Some(
                self.config
                    .timeout
                    .saturating_sub(st.state_changed_at.elapsed()),
            ),
            _ => None,
        }
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> CircuitStats {
        let st = self.state.lock();
        CircuitStats {
            state: st.state,
            consecutive_failures: st.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            total_requests: st.total_requests,
            total_failures: st.total_failures,
            failure_rate: st.total_failures as f64 / st.total_requests.max(1) as f64,
            time_in_current_state: st.state_changed_at.elapsed(),
            time_since_last_failure: st.last_failure_time.map(|t| t.elapsed()),
            timeout: self.config.timeout,
        }
    }

    /// Emit a statistics event to the sink.
    pub fn emit_statistics(&self) {
        let stats = self.stats();
        self.sink.emit(&TelemetryEvent::CircuitStatistics {
            destination: self.destination.clone(),
            stats,
        });
    }

    fn transition(
        &self,
        st: &mut BreakerState,
        to: CircuitState,
        reason: &str,
        now: Instant,
    ) -> TelemetryEvent {
        let from = st.state;
        let time_in_previous = now.duration_since(st.state_changed_at);
        st.state = to;
        st.state_changed_at = now;

        TelemetryEvent::CircuitStateChanged {
            destination: self.destination.clone(),
            from,
            to,
            time_in_previous,
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("destination", &self.destination)
            .field("state", &self.state())
            .finish()
    }
}
