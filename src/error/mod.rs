//! Upstream Error Types
//!
//! Error taxonomy surfaced to callers of the executor. Every variant that
//! concerns a remote call carries the destination it was aimed at so that
//! failures can be diagnosed without extra context.

use std::time::Duration;
use thiserror::Error;

/// Result type for upstream operations.
pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Root error type for the outbound client core.
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// Credentials were rejected or a token could not be acquired.
    #[error("Authentication failed for {destination}: {message}")]
    Authentication {
        /// Destination (token endpoint host or upstream host).
        destination: String,
        /// Human readable cause.
        message: String,
        /// HTTP status returned, if any.
        status: Option<u16>,
    },

    /// The circuit breaker for the destination is open; no request was sent.
    #[error("Circuit breaker open for {destination}")]
    CircuitOpen {
        /// Destination whose breaker is open.
        destination: String,
        /// Time left until the breaker admits a probe.
        retry_in: Option<Duration>,
    },

    /// No rate-limit token was available and the caller opted out of waiting.
    #[error("Rate limit exceeded for {destination}")]
    RateLimitExceeded {
        /// Destination that is being throttled.
        destination: String,
    },

    /// Retries were exhausted or the upstream reported a terminal failure.
    #[error("Operation failed for {destination} after {attempts} attempt(s): {message}")]
    OperationFailed {
        /// Destination of the failed call.
        destination: String,
        /// Number of attempts made.
        attempts: u32,
        /// Last HTTP status observed.
        last_status: Option<u16>,
        /// Human readable cause.
        message: String,
        /// Last underlying error.
        #[source]
        source: Option<Box<UpstreamError>>,
    },

    /// An accepted asynchronous operation did not finish before the client gave up.
    #[error("Gave up waiting for async operation at {status_url} ({destination}) after {waited:?}")]
    OperationTimeout {
        /// Destination of the operation.
        destination: String,
        /// Status reference that was being polled.
        status_url: String,
        /// Time spent waiting.
        waited: Duration,
    },

    /// The overall per-call deadline was reached.
    #[error("Call to {destination} exceeded its {timeout:?} deadline after {attempts} attempt(s)")]
    CallTimeout {
        /// Destination of the call.
        destination: String,
        /// Attempts started before the deadline.
        attempts: u32,
        /// Configured deadline.
        timeout: Duration,
    },

    /// Network-level failure.
    #[error("Transport error for {destination}: {failure}")]
    Transport {
        /// Destination of the call.
        destination: String,
        /// Transport failure details.
        #[source]
        failure: TransportFailure,
    },

    /// Non-success HTTP status for a single attempt.
    #[error("HTTP {status} from {destination}")]
    Http {
        /// Destination of the call.
        destination: String,
        /// HTTP status code.
        status: u16,
        /// Response body, if readable.
        body: Option<String>,
        /// Server supplied `Retry-After`.
        retry_after: Option<Duration>,
        /// Whether the retry policy classified this status as transient.
        transient: bool,
    },

    /// Response could not be decoded.
    #[error("Malformed response from {destination}: {message}")]
    MalformedResponse {
        /// Destination of the call.
        destination: String,
        /// Decoder message.
        message: String,
    },

    /// Invalid configuration or request parameters.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Human readable cause.
        message: String,
    },
}

impl UpstreamError {
    /// Get error code for telemetry.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Authentication { .. } => "UPSTREAM_AUTH",
            Self::CircuitOpen { .. } => "UPSTREAM_CIRCUIT_OPEN",
            Self::RateLimitExceeded { .. } => "UPSTREAM_RATE_LIMITED",
            Self::OperationFailed { .. } => "UPSTREAM_OPERATION_FAILED",
            Self::OperationTimeout { .. } => "UPSTREAM_OPERATION_TIMEOUT",
            Self::CallTimeout { .. } => "UPSTREAM_CALL_TIMEOUT",
            Self::Transport { .. } => "UPSTREAM_TRANSPORT",
            Self::Http { .. } => "UPSTREAM_HTTP",
            Self::MalformedResponse { .. } => "UPSTREAM_MALFORMED",
            Self::Configuration { .. } => "UPSTREAM_CONFIG",
        }
    }

    /// Check if the retry loop may attempt the call again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { failure, .. } => failure.is_transient(),
            Self::Http { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Get retry-after duration if the server supplied one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Check if the error counts as a failure of the destination itself.
    pub fn trips_breaker(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Last HTTP status associated with the error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Authentication { status, .. } => *status,
            Self::OperationFailed { last_status, .. } => *last_status,
            _ => None,
        }
    }

    /// Attempts made before the error surfaced.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::OperationFailed { attempts, .. } | Self::CallTimeout { attempts, .. } => {
                Some(*attempts)
            }
            _ => None,
        }
    }

    /// Destination the error refers to.
    pub fn destination(&self) -> Option<&str> {
        match self {
            Self::Authentication { destination, .. }
            | Self::CircuitOpen { destination, .. }
            | Self::RateLimitExceeded { destination }
            | Self::OperationFailed { destination, .. }
            | Self::OperationTimeout { destination, .. }
            | Self::CallTimeout { destination, .. }
            | Self::Transport { destination, .. }
            | Self::Http { destination, .. }
            | Self::MalformedResponse { destination, .. } => Some(destination),
            Self::Configuration { .. } => None,
        }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a malformed response error.
    pub fn malformed(destination: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            destination: destination.into(),
            message: message.into(),
        }
    }
}

/// Kind of network failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Request timed out.
    Timeout,
    /// Connection could not be established.
    Connect,
    /// Connection was reset or closed mid-request.
    ConnectionReset,
    /// Response body could not be read.
    Body,
    /// Anything else (TLS, invalid request).
    Other,
}

/// Network failure reported by a transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct TransportFailure {
    /// Failure kind.
    pub kind: TransportErrorKind,
    /// Underlying message.
    pub message: String,
}

impl TransportFailure {
    /// Create new transport failure.
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Timeout failure.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    /// Connection reset failure.
    pub fn connection_reset(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ConnectionReset, message)
    }

    /// Check if the failure is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Timeout
                | TransportErrorKind::Connect
                | TransportErrorKind::ConnectionReset
        )
    }
}

impl From<reqwest::Error> for TransportFailure {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_body() || err.is_decode() {
            TransportErrorKind::Body
        } else if is_connection_reset(&err) {
            TransportErrorKind::ConnectionReset
        } else {
            TransportErrorKind::Other
        };
        Self::new(kind, err.to_string())
    }
}

fn is_connection_reset(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        source = e.source();
    }
    false
}

impl From<url::ParseError> for UpstreamError {
    fn from(err: url::ParseError) -> Self {
        UpstreamError::Configuration {
            message: format!("Invalid URL: {}", err),
        }
    }
}

/// Get user-friendly error message.
pub fn get_user_message(error: &UpstreamError) -> String {
    match error {
        UpstreamError::Authentication { .. } => {
            "The service rejected the configured credentials.".to_string()
        }
        UpstreamError::CircuitOpen { .. } => {
            "The service is temporarily unavailable. Please try again later.".to_string()
        }
        UpstreamError::RateLimitExceeded { .. } => {
            "Too many requests. Please wait a moment and try again.".to_string()
        }
        UpstreamError::OperationTimeout { .. } => {
            "The operation is still running on the server. Check back later.".to_string()
        }
        UpstreamError::CallTimeout { .. } => {
            "The request timed out. Please check your connection and try again.".to_string()
        }
        _ => "The request to the service failed.".to_string(),
    }
}
