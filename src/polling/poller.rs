//! Async Operation Poller
//!
//! Completes "202 Accepted" operations by polling the status reference the
//! server handed out until a terminal status arrives or the client gives up.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::core::{HttpRequest, HttpResponse};
use crate::error::{UpstreamError, UpstreamResult};
use crate::resilience::parse_retry_after;
use crate::telemetry::{NoOpSink, SharedSink, TelemetryEvent};
use crate::types::{AsyncOperationResult, PollerConfig};

/// Headers that may carry the status reference, in order of preference.
pub const STATUS_REFERENCE_HEADERS: [&str; 3] =
    ["location", "operation-location", "azure-asyncoperation"];

/// Result of one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The operation is still running.
    InProgress,
    /// The operation finished successfully.
    Succeeded,
    /// The operation finished with a failure.
    Failed,
    /// The status endpoint itself failed transiently; polling continues.
    Retrying,
}

/// Accepted operation being polled.
#[derive(Debug, Clone)]
pub struct AsyncOperation {
    pub destination: String,
    pub status_url: Url,
    /// The response that accepted the operation. Never modified.
    pub accepted: HttpResponse,
}

impl AsyncOperation {
    /// Describe the operation accepted by `response` to a request for
    /// `request_url`. `None` when the response carries no status reference.
    pub fn from_response(
        destination: impl Into<String>,
        request_url: &Url,
        response: &HttpResponse,
    ) -> UpstreamResult<Option<Self>> {
        let reference = STATUS_REFERENCE_HEADERS
            .iter()
            .find_map(|name| response.header(name))
            .map(str::trim)
            .filter(|v| !v.is_empty());

        let Some(reference) = reference else {
            return Ok(None);
        };

        let destination = destination.into();
        let status_url = request_url.join(reference).map_err(|e| {
            UpstreamError::malformed(
                destination.clone(),
                format!("Invalid status reference {}: {}", reference, e),
            )
        })?;

        Ok(Some(Self {
            destination,
            status_url,
            accepted: response.clone(),
        }))
    }
}

enum Classified {
    InProgress(Option<Duration>),
    Succeeded(serde_json::Value, u16),
    Failed(String, u16),
    Transient(Option<Duration>),
}

/// Polls accepted operations to completion.
pub struct AsyncOperationPoller {
    config: PollerConfig,
    transient_statuses: Vec<u16>,
    sink: SharedSink,
}

impl AsyncOperationPoller {
    /// Create new poller.
    pub fn new(config: PollerConfig) -> Self {
        Self {
            config,
            transient_statuses: vec![429, 503],
            sink: Arc::new(NoOpSink),
        }
    }

    /// Statuses from the status endpoint that keep the poll loop going.
    pub fn with_transient_statuses(mut self, statuses: impl Into<Vec<u16>>) -> Self {
        self.transient_statuses = statuses.into();
        self
    }

    /// Route poll events to `sink`.
    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Configuration.
    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Poll `operation` until it finishes, issuing each GET through `fetch`.
    ///
    /// Errors from `fetch` that are retryable keep the loop going; any other
    /// error is returned as is.
    pub async fn poll<F, Fut>(
        &self,
        operation: &AsyncOperation,
        mut fetch: F,
    ) -> UpstreamResult<AsyncOperationResult>
    where
        F: FnMut(HttpRequest) -> Fut,
        Fut: Future<Output = UpstreamResult<HttpResponse>>,
    {
        let started = Instant::now();
        let deadline = started + self.config.max_wait;
        let mut delay = operation
            .accepted
            .header("retry-after")
            .and_then(parse_retry_after)
            .unwrap_or(self.config.poll_interval);
        let mut poll = 0u32;

        debug!(
            destination = %operation.destination,
            status_url = %operation.status_url,
            "Polling accepted operation"
        );

        let timed_out = |now: Instant| UpstreamError::OperationTimeout {
            destination: operation.destination.clone(),
            status_url: operation.status_url.to_string(),
            waited: now.duration_since(started),
        };

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(timed_out(now));
            }
            tokio::time::sleep(delay.min(deadline - now)).await;

            // No request once the wait budget is spent.
            let now = Instant::now();
            if now >= deadline {
                return Err(timed_out(now));
            }

            poll += 1;
            let request = HttpRequest::get(operation.status_url.as_str());
            let classified = match fetch(request).await {
                Ok(response) => self.classify(&response),
                Err(error) if error.is_retryable() => {
                    debug!(
                        destination = %operation.destination,
                        poll,
                        error = %error,
                        "Transient failure polling status"
                    );
                    Classified::Transient(error.retry_after())
                }
                Err(error) => return Err(error),
            };

            let outcome = match &classified {
                Classified::InProgress(_) => PollOutcome::InProgress,
                Classified::Transient(_) => PollOutcome::Retrying,
                Classified::Succeeded(..) => PollOutcome::Succeeded,
                Classified::Failed(..) => PollOutcome::Failed,
            };
            self.sink.emit(&TelemetryEvent::AsyncOperationPolled {
                destination: operation.destination.clone(),
                status_url: operation.status_url.to_string(),
                poll,
                outcome,
            });

            match classified {
                Classified::InProgress(retry_after) | Classified::Transient(retry_after) => {
                    delay = retry_after.unwrap_or(self.config.poll_interval);
                }
                Classified::Succeeded(data, status) => {
                    return Ok(AsyncOperationResult::new(
                        data,
                        status,
                        operation.accepted.clone(),
                    ));
                }
                Classified::Failed(message, status) => {
                    return Err(UpstreamError::OperationFailed {
                        destination: operation.destination.clone(),
                        attempts: poll,
                        last_status: Some(status),
                        message,
                        source: None,
                    });
                }
            }
        }
    }

    fn classify(&self, response: &HttpResponse) -> Classified {
        let retry_after = response.header("retry-after").and_then(parse_retry_after);

        if response.status == 202 {
            return Classified::InProgress(retry_after);
        }

        if self.transient_statuses.contains(&response.status) {
            return Classified::Transient(retry_after);
        }

        if !response.is_success() {
            let body = response.text();
            let message = if body.trim().is_empty() {
                format!("Status endpoint returned HTTP {}", response.status)
            } else {
                format!("Status endpoint returned HTTP {}: {}", response.status, body)
            };
            return Classified::Failed(message, response.status);
        }

        let data = if response.body.iter().all(u8::is_ascii_whitespace) {
            serde_json::json!({})
        } else {
            response
                .json::<serde_json::Value>()
                .unwrap_or_else(|_| serde_json::Value::String(response.text()))
        };

        let status = data
            .get(&self.config.status_field)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_ascii_lowercase());

        match status {
            Some(s) if matches_any(&self.config.in_progress_values, &s) => {
                Classified::InProgress(retry_after)
            }
            Some(s) if matches_any(&self.config.failure_values, &s) => {
                Classified::Failed(failure_details(&data, &s), response.status)
            }
            Some(s) if !matches_any(&self.config.success_values, &s) => {
                warn!(status = %s, "Unrecognized operation status, treating as complete");
                Classified::Succeeded(data, response.status)
            }
            _ => Classified::Succeeded(data, response.status),
        }
    }
}

fn matches_any(values: &[String], status: &str) -> bool {
    values.iter().any(|v| v.eq_ignore_ascii_case(status))
}

fn failure_details(data: &serde_json::Value, status: &str) -> String {
    let error = data.get("error");
    let message = error
        .and_then(|e| e.get("message"))
        .or_else(|| error.filter(|e| e.is_string()))
        .or_else(|| data.get("message"))
        .and_then(|v| v.as_str());
    let code = error.and_then(|e| e.get("code")).and_then(|v| v.as_str());

    match (code, message) {
        (Some(code), Some(message)) => format!("Operation {}: {} ({})", status, message, code),
        (None, Some(message)) => format!("Operation {}: {}", status, message),
        (Some(code), None) => format!("Operation {}: {}", status, code),
        (None, None) => format!("Operation {}", status),
    }
}
