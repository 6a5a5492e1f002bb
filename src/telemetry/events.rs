//! Telemetry Events
//!
//! Event-emission interface for state changes and statistics. The core only
//! depends on [`TelemetrySink`]; hosts decide where events end up.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::polling::PollOutcome;
use crate::resilience::{CircuitState, CircuitStats, RateTier};

/// Observable event emitted by the client core.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// A circuit breaker changed state.
    CircuitStateChanged {
        destination: String,
        from: CircuitState,
        to: CircuitState,
        time_in_previous: Duration,
        reason: String,
    },
    /// Statistics snapshot for one breaker.
    CircuitStatistics {
        destination: String,
        stats: CircuitStats,
    },
    /// The rate limiter changed its refill rate.
    RateAdjusted {
        destination: String,
        previous_rate: f64,
        new_rate: f64,
        remaining_fraction: Option<f64>,
        tier: RateTier,
    },
    /// A failed attempt will be retried after `delay`.
    RetryScheduled {
        destination: String,
        attempt: u32,
        delay: Duration,
        status: Option<u16>,
    },
    /// A bearer token was acquired from the token endpoint.
    TokenAcquired {
        tenant_id: String,
        client_id: String,
        scope: String,
        expires_in: Duration,
    },
    /// One poll of an accepted asynchronous operation completed.
    AsyncOperationPolled {
        destination: String,
        status_url: String,
        poll: u32,
        outcome: PollOutcome,
    },
}

impl TelemetryEvent {
    /// Short stable name of the event kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CircuitStateChanged { .. } => "circuit_state_changed",
            Self::CircuitStatistics { .. } => "circuit_statistics",
            Self::RateAdjusted { .. } => "rate_adjusted",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::TokenAcquired { .. } => "token_acquired",
            Self::AsyncOperationPolled { .. } => "async_operation_polled",
        }
    }
}

/// Receiver of telemetry events.
///
/// Implementations must not block; events are emitted outside of any
/// internal lock but on the caller's task.
pub trait TelemetrySink: Send + Sync {
    /// Receive one event.
    fn emit(&self, event: &TelemetryEvent);
}

/// Shared sink handle.
pub type SharedSink = Arc<dyn TelemetrySink>;

/// Sink that logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::CircuitStateChanged {
                destination,
                from,
                to,
                time_in_previous,
                reason,
            } => {
                if *to == CircuitState::Open {
                    warn!(
                        destination = %destination,
                        from = %from,
                        to = %to,
                        time_in_previous_ms = time_in_previous.as_millis() as u64,
                        reason = %reason,
                        "Circuit breaker opened"
                    );
                } else {
                    info!(
                        destination = %destination,
                        from = %from,
                        to = %to,
                        time_in_previous_ms = time_in_previous.as_millis() as u64,
                        reason = %reason,
                        "Circuit breaker state changed"
                    );
                }
            }
            TelemetryEvent::CircuitStatistics { destination, stats } => {
                info!(
                    destination = %destination,
                    state = %stats.state,
                    consecutive_failures = stats.consecutive_failures,
                    total_requests = stats.total_requests,
                    total_failures = stats.total_failures,
                    failure_rate = stats.failure_rate,
                    "Circuit breaker statistics"
                );
            }
            TelemetryEvent::RateAdjusted {
                destination,
                previous_rate,
                new_rate,
                remaining_fraction,
                tier,
            } => {
                if tier.is_emergency() {
                    warn!(
                        destination = %destination,
                        previous_rate,
                        new_rate,
                        remaining_fraction = ?remaining_fraction,
                        tier = %tier,
                        "Rate limit nearly exhausted, slowing down"
                    );
                } else {
                    info!(
                        destination = %destination,
                        previous_rate,
                        new_rate,
                        remaining_fraction = ?remaining_fraction,
                        tier = %tier,
                        "Adjusted request rate"
                    );
                }
            }
            TelemetryEvent::RetryScheduled {
                destination,
                attempt,
                delay,
                status,
            } => {
                debug!(
                    destination = %destination,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    status = ?status,
                    "Retry scheduled"
                );
            }
            TelemetryEvent::TokenAcquired {
                tenant_id,
                client_id,
                scope,
                expires_in,
            } => {
                info!(
                    tenant_id = %tenant_id,
                    client_id = %client_id,
                    scope = %scope,
                    expires_in_secs = expires_in.as_secs(),
                    "Acquired access token"
                );
            }
            TelemetryEvent::AsyncOperationPolled {
                destination,
                status_url,
                poll,
                outcome,
            } => {
                debug!(
                    destination = %destination,
                    status_url = %status_url,
                    poll,
                    outcome = ?outcome,
                    "Polled async operation"
                );
            }
        }
    }
}

/// Sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpSink;

impl TelemetrySink for NoOpSink {
    fn emit(&self, _event: &TelemetryEvent) {}
}

/// Sink that records events in memory, for tests.
#[derive(Debug, Default)]
pub struct InMemorySink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl InMemorySink {
    /// Create new in-memory sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded events.
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    /// Recorded events with the given name.
    pub fn events_named(&self, name: &str) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.name() == name)
            .cloned()
            .collect()
    }

    /// Recorded breaker transitions as `(from, to)` pairs.
    pub fn circuit_transitions(&self) -> Vec<(CircuitState, CircuitState)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                TelemetryEvent::CircuitStateChanged { from, to, .. } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    /// Clear all events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl TelemetrySink for InMemorySink {
    fn emit(&self, event: &TelemetryEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Default sink: log through `tracing`.
pub fn tracing_sink() -> SharedSink {
    Arc::new(TracingSink)
}
