//! Metrics
//!
//! Call-level success and latency counters for a request executor.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Point-in-time view of [`ExecutorMetrics`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub total_response_time: Duration,
    /// Success rate as a percentage (0-100).
    pub success_rate: f64,
    pub average_response_time: Duration,
    /// Failure counts keyed by error code.
    pub errors: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct Counters {
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    total_response_time: Duration,
    errors: HashMap<String, u64>,
}

/// Success/failure and response time collector.
#[derive(Debug, Default)]
pub struct ExecutorMetrics {
    counters: Mutex<Counters>,
}

impl ExecutorMetrics {
    /// Create new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful call.
    pub fn record_success(&self, duration: Duration) {
        let mut c = self.counters.lock();
        c.total_calls += 1;
        c.successful_calls += 1;
        c.total_response_time += duration;
    }

    /// Record a failed call.
    pub fn record_failure(&self, error_code: &str, duration: Duration) {
        let mut c = self.counters.lock();
        c.total_calls += 1;
        c.failed_calls += 1;
        c.total_response_time += duration;
        *c.errors.entry(error_code.to_string()).or_insert(0) += 1;
    }

    /// Current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = self.counters.lock();
        let (success_rate, average_response_time) = if c.total_calls == 0 {
            (0.0, Duration::ZERO)
        } else {
            (
                c.successful_calls as f64 / c.total_calls as f64 * 100.0,
                c.total_response_time.div_f64(c.total_calls as f64),
            )
        };

        MetricsSnapshot {
            total_calls: c.total_calls,
            successful_calls: c.successful_calls,
            failed_calls: c.failed_calls,
            total_response_time: c.total_response_time,
            success_rate,
            average_response_time,
            errors: c.errors.clone(),
        }
    }

    /// Reset all counters.
    pub fn reset(&self) {
        *self.counters.lock() = Counters::default();
    }
}
