//! Request Executor
//!
//! Runs one outbound call through the full resilience pipeline: rate limit
//! slot, circuit breaker admission, bearer token, HTTP exchange, outcome
//! classification, retry with backoff and completion of accepted
//! asynchronous operations.

use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::core::{HttpMethod, HttpRequest, HttpResponse, HttpTransport};
use crate::error::{UpstreamError, UpstreamResult};
use crate::polling::{AsyncOperation, AsyncOperationPoller};
use crate::resilience::{
    destination_key, parse_retry_after, CircuitBreaker, CircuitBreakerRegistry, RateLimiter,
    RateLimiterRegistry, RetryPolicy,
};
use crate::telemetry::{
    tracing_sink, ExecutorMetrics, MetricsSnapshot, SharedSink, TelemetryEvent,
};
use crate::token::TokenCache;
use crate::types::{ClientConfig, ClientCredentials, RateLimitMode, UpstreamResponse};

/// Token source for authenticated calls.
struct Authenticator {
    cache: Arc<TokenCache>,
    credentials: ClientCredentials,
}

/// Per-call state shared by every attempt.
struct Call<'a> {
    method: HttpMethod,
    url: &'a Url,
    destination: &'a str,
    limiter: &'a RateLimiter,
    breaker: &'a CircuitBreaker,
    body: Option<&'a [u8]>,
    auth_required: bool,
    deadline: Instant,
}

/// Builder for [`RequestExecutor`].
pub struct RequestExecutorBuilder<T: HttpTransport> {
    transport: Arc<T>,
    config: ClientConfig,
    sink: Option<SharedSink>,
    rate_limiters: Option<Arc<RateLimiterRegistry>>,
    circuit_breakers: Option<Arc<CircuitBreakerRegistry>>,
    auth: Option<Authenticator>,
}

impl<T: HttpTransport> RequestExecutorBuilder<T> {
    /// Use `config` instead of the defaults.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Route state-change events to `sink`. Defaults to [`tracing_sink`].
    pub fn sink(mut self, sink: SharedSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Share an existing limiter registry.
    pub fn rate_limiters(mut self, registry: Arc<RateLimiterRegistry>) -> Self {
        self.rate_limiters = Some(registry);
        self
    }

    /// Share an existing breaker registry.
    pub fn circuit_breakers(mut self, registry: Arc<CircuitBreakerRegistry>) -> Self {
        self.circuit_breakers = Some(registry);
        self
    }

    /// Authenticate calls with tokens for `credentials` taken from `cache`.
    pub fn token_cache(mut self, cache: Arc<TokenCache>, credentials: ClientCredentials) -> Self {
        self.auth = Some(Authenticator { cache, credentials });
        self
    }

    /// Build the executor.
    pub fn build(self) -> RequestExecutor<T> {
        let sink = self.sink.unwrap_or_else(tracing_sink);
        let config = self.config;

        let rate_limiters = self.rate_limiters.unwrap_or_else(|| {
            let registry = RateLimiterRegistry::new(config.rate_limiter.clone())
                .with_header_names(config.rate_limit_headers.clone())
                .with_sink(sink.clone());
            for (pattern, limits) in &config.endpoint_limits {
                registry.configure_endpoint(pattern.clone(), limits.clone());
            }
            Arc::new(registry)
        });

        let circuit_breakers = self.circuit_breakers.unwrap_or_else(|| {
            Arc::new(
                CircuitBreakerRegistry::new(config.circuit_breaker.clone()).with_sink(sink.clone()),
            )
        });

        let poller = AsyncOperationPoller::new(config.poller.clone())
            .with_transient_statuses(config.retry.retryable_statuses.clone())
            .with_sink(sink.clone());

        RequestExecutor {
            transport: self.transport,
            retry: RetryPolicy::new(config.retry.clone()),
            poller,
            rate_limiters,
            circuit_breakers,
            auth: self.auth,
            metrics: ExecutorMetrics::new(),
            sink,
            config,
        }
    }
}

/// Executes outbound calls with rate limiting, circuit breaking, retries,
/// authentication and async operation polling.
pub struct RequestExecutor<T: HttpTransport> {
    transport: Arc<T>,
    config: ClientConfig,
    retry: RetryPolicy,
    poller: AsyncOperationPoller,
    rate_limiters: Arc<RateLimiterRegistry>,
    circuit_breakers: Arc<CircuitBreakerRegistry>,
    auth: Option<Authenticator>,
    metrics: ExecutorMetrics,
    sink: SharedSink,
}

impl<T: HttpTransport> RequestExecutor<T> {
    /// Create an executor with `config` and no authentication.
    pub fn new(config: ClientConfig, transport: Arc<T>) -> Self {
        Self::builder(transport).config(config).build()
    }

    /// Start building an executor on `transport`.
    pub fn builder(transport: Arc<T>) -> RequestExecutorBuilder<T> {
        RequestExecutorBuilder {
            transport,
            config: ClientConfig::default(),
            sink: None,
            rate_limiters: None,
            circuit_breakers: None,
            auth: None,
        }
    }

    /// Configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Limiter registry.
    pub fn rate_limiters(&self) -> &Arc<RateLimiterRegistry> {
        &self.rate_limiters
    }

    /// Breaker registry.
    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.circuit_breakers
    }

    /// Call counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Emit breaker statistics for every known destination.
    pub fn emit_statistics(&self) {
        self.circuit_breakers.emit_statistics();
    }

    /// GET `url`.
    pub async fn get(&self, url: &str, auth_required: bool) -> UpstreamResult<UpstreamResponse> {
        self.execute(HttpMethod::Get, url, None, auth_required).await
    }

    /// POST `body` to `url`.
    pub async fn post(
        &self,
        url: &str,
        body: serde_json::Value,
        auth_required: bool,
    ) -> UpstreamResult<UpstreamResponse> {
        self.execute(HttpMethod::Post, url, Some(body), auth_required)
            .await
    }

    /// PUT `body` to `url`.
    pub async fn put(
        &self,
        url: &str,
        body: serde_json::Value,
        auth_required: bool,
    ) -> UpstreamResult<UpstreamResponse> {
        self.execute(HttpMethod::Put, url, Some(body), auth_required)
            .await
    }

    /// PATCH `url` with `body`.
    pub async fn patch(
        &self,
        url: &str,
        body: serde_json::Value,
        auth_required: bool,
    ) -> UpstreamResult<UpstreamResponse> {
        self.execute(HttpMethod::Patch, url, Some(body), auth_required)
            .await
    }

    /// DELETE `url`.
    pub async fn delete(&self, url: &str, auth_required: bool) -> UpstreamResult<UpstreamResponse> {
        self.execute(HttpMethod::Delete, url, None, auth_required)
            .await
    }

    /// Execute and deserialize the resulting payload.
    pub async fn execute_json<R: DeserializeOwned>(
        &self,
        method: HttpMethod,
        url: &str,
        body: Option<serde_json::Value>,
        auth_required: bool,
    ) -> UpstreamResult<R> {
        let response = self.execute(method, url, body, auth_required).await?;
        response.json().map_err(|e| {
            let destination = Url::parse(url)
                .map(|u| destination_key(&u))
                .unwrap_or_else(|_| url.to_string());
            UpstreamError::malformed(destination, e.to_string())
        })
    }

    /// Execute one call.
    ///
    /// Transient failures are retried up to the configured attempt count
    /// within the per-call deadline. A `202 Accepted` carrying a status
    /// reference is polled to completion and returned as
    /// [`UpstreamResponse::Completed`].
    #[instrument(skip(self, body))]
    pub async fn execute(
        &self,
        method: HttpMethod,
        url: &str,
        body: Option<serde_json::Value>,
        auth_required: bool,
    ) -> UpstreamResult<UpstreamResponse> {
        let started = Instant::now();
        let result = self.run(method, url, body, auth_required).await;

        match &result {
            Ok(_) => self.metrics.record_success(started.elapsed()),
            Err(e) => self.metrics.record_failure(e.error_code(), started.elapsed()),
        }
        result
    }

    async fn run(
        &self,
        method: HttpMethod,
        url: &str,
        body: Option<serde_json::Value>,
        auth_required: bool,
    ) -> UpstreamResult<UpstreamResponse> {
        let url = Url::parse(url)?;
        if auth_required && self.auth.is_none() {
            return Err(UpstreamError::configuration(
                "Authenticated call requested but no credentials are configured",
            ));
        }

        let body = body
            .map(|value| serde_json::to_vec(&value))
            .transpose()
            .map_err(|e| UpstreamError::configuration(format!("Invalid request body: {}", e)))?;

        let destination = destination_key(&url);
        let limiter = self.rate_limiters.for_url(&url);
        let breaker = self.circuit_breakers.get(&destination);

        let call = Call {
            method,
            url: &url,
            destination: &destination,
            limiter: &limiter,
            breaker: &breaker,
            body: body.as_deref(),
            auth_required,
            deadline: Instant::now() + self.config.call_timeout,
        };

        let mut attempt = 1;
        loop {
            let error = match self.attempt(&call, attempt).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            if !error.is_retryable() {
                return Err(self.terminal(&call, attempt, error));
            }

            if !self.retry.should_retry(attempt, &error) {
                warn!(
                    destination = %destination,
                    attempts = attempt,
                    error = %error,
                    "Retries exhausted"
                );
                return Err(UpstreamError::OperationFailed {
                    destination: destination.clone(),
                    attempts: attempt,
                    last_status: error.status_code(),
                    message: "retries exhausted".to_string(),
                    source: Some(Box::new(error)),
                });
            }

            let delay = self.retry.delay_for_error(attempt, &error);
            let resumes_at = Instant::now().checked_add(delay);
            if resumes_at.map_or(true, |at| at >= call.deadline) {
                warn!(
                    destination = %destination,
                    attempts = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Backoff would overrun the call deadline"
                );
                return Err(self.timed_out(&call, attempt));
            }

            warn!(
                destination = %destination,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after transient failure"
            );
            self.sink.emit(&TelemetryEvent::RetryScheduled {
                destination: destination.clone(),
                attempt,
                delay,
                status: error.status_code(),
            });
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt(&self, call: &Call<'_>, attempt: u32) -> UpstreamResult<UpstreamResponse> {
        match self.config.rate_limit_mode {
            RateLimitMode::Block => {
                tokio::time::timeout_at(call.deadline, call.limiter.acquire())
                    .await
                    .map_err(|_| self.timed_out(call, attempt - 1))?;
            }
            RateLimitMode::FailFast => {
                if !call.limiter.try_acquire() {
                    warn!(destination = %call.destination, "Rate limit exceeded");
                    return Err(UpstreamError::RateLimitExceeded {
                        destination: call.destination.to_string(),
                    });
                }
            }
        }

        if !call.breaker.allow() {
            warn!(destination = %call.destination, "Circuit open, failing fast");
            return Err(UpstreamError::CircuitOpen {
                destination: call.destination.to_string(),
                retry_in: call.breaker.retry_in(),
            });
        }

        let mut request = HttpRequest::new(call.method, call.url.as_str());
        if let Some(body) = call.body {
            request = request
                .with_header("Content-Type", "application/json")
                .with_body(body.to_vec());
        }
        let request =
            match tokio::time::timeout_at(call.deadline, self.prepare(request, call.auth_required))
                .await
            {
                Ok(Ok(request)) => request,
                Ok(Err(error)) => {
                    call.breaker.release_probe();
                    return Err(error);
                }
                Err(_) => {
                    call.breaker.release_probe();
                    return Err(self.timed_out(call, attempt - 1));
                }
            };

        debug!(destination = %call.destination, attempt, "Sending request");
        let response =
            match tokio::time::timeout_at(call.deadline, self.transport.send(request)).await {
                Err(_) => {
                    call.breaker.record_failure();
                    return Err(self.timed_out(call, attempt));
                }
                Ok(Err(failure)) => {
                    call.breaker.record_failure();
                    return Err(UpstreamError::Transport {
                        destination: call.destination.to_string(),
                        failure,
                    });
                }
                Ok(Ok(response)) => response,
            };

        call.limiter.adapt(&response.headers);
        self.classify(call, response).await
    }

    async fn classify(
        &self,
        call: &Call<'_>,
        response: HttpResponse,
    ) -> UpstreamResult<UpstreamResponse> {
        if response.is_success() {
            call.breaker.record_success();

            if response.status == 202 {
                if let Some(operation) =
                    AsyncOperation::from_response(call.destination, call.url, &response)?
                {
                    return self.complete(call, &operation).await;
                }
                debug!(
                    destination = %call.destination,
                    "Accepted without a status reference"
                );
            }
            return Ok(UpstreamResponse::Direct(response));
        }

        if response.status == 401 && call.auth_required {
            call.breaker.record_success();
            if let Some(auth) = &self.auth {
                auth.cache.invalidate(&auth.credentials);
            }
            warn!(destination = %call.destination, "Access token rejected");
            return Err(UpstreamError::Authentication {
                destination: call.destination.to_string(),
                message: "access token rejected by upstream".to_string(),
                status: Some(401),
            });
        }

        let body = response.text();
        let error = UpstreamError::Http {
            destination: call.destination.to_string(),
            status: response.status,
            body: (!body.trim().is_empty()).then_some(body),
            retry_after: response.header("retry-after").and_then(parse_retry_after),
            transient: self.retry.is_retryable_status(response.status),
        };

        if error.trips_breaker() {
            call.breaker.record_failure();
        } else {
            call.breaker.record_success();
        }
        Err(error)
    }

    async fn complete(
        &self,
        call: &Call<'_>,
        operation: &AsyncOperation,
    ) -> UpstreamResult<UpstreamResponse> {
        let limiter = call.limiter;
        let auth_required = call.auth_required;

        let result = self
            .poller
            .poll(operation, move |request| async move {
                self.fetch_status(request, limiter, &operation.destination, auth_required)
                    .await
            })
            .await?;
        Ok(UpstreamResponse::Completed(result))
    }

    async fn fetch_status(
        &self,
        request: HttpRequest,
        limiter: &RateLimiter,
        destination: &str,
        auth_required: bool,
    ) -> UpstreamResult<HttpResponse> {
        match self.config.rate_limit_mode {
            RateLimitMode::Block => limiter.acquire().await,
            RateLimitMode::FailFast => {
                if !limiter.try_acquire() {
                    return Err(UpstreamError::RateLimitExceeded {
                        destination: destination.to_string(),
                    });
                }
            }
        }

        let request = self.prepare(request, auth_required).await?;
        let response = self
            .transport
            .send(request)
            .await
            .map_err(|failure| UpstreamError::Transport {
                destination: destination.to_string(),
                failure,
            })?;

        limiter.adapt(&response.headers);
        Ok(response)
    }

    /// Add default headers, the user agent and the bearer token.
    async fn prepare(
        &self,
        mut request: HttpRequest,
        auth_required: bool,
    ) -> UpstreamResult<HttpRequest> {
        for (name, value) in &self.config.default_headers {
            if request.header(name).is_none() {
                request = request.with_header(name.clone(), value.clone());
            }
        }
        if request.header("user-agent").is_none() {
            request = request.with_header("User-Agent", self.config.user_agent.clone());
        }
        request = request.with_header("Accept", "application/json");

        if auth_required {
            if let Some(auth) = &self.auth {
                let token = auth.cache.get_token(&auth.credentials).await?;
                request = request.with_header("Authorization", token.authorization_header());
            }
        }
        Ok(request)
    }

    fn terminal(&self, call: &Call<'_>, attempts: u32, error: UpstreamError) -> UpstreamError {
        match error {
            UpstreamError::Http { status, .. } => UpstreamError::OperationFailed {
                destination: call.destination.to_string(),
                attempts,
                last_status: Some(status),
                message: format!("HTTP {}", status),
                source: Some(Box::new(error)),
            },
            other => other,
        }
    }

    fn timed_out(&self, call: &Call<'_>, attempts: u32) -> UpstreamError {
        UpstreamError::CallTimeout {
            destination: call.destination.to_string(),
            attempts,
            timeout: self.config.call_timeout,
        }
    }
}

impl<T: HttpTransport> std::fmt::Debug for RequestExecutor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("retry", &self.retry)
            .field("call_timeout", &self.config.call_timeout)
            .field("authenticated", &self.auth.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MockHttpTransport;
    use crate::error::TransportFailure;
    use crate::resilience::CircuitState;
    use crate::telemetry::InMemorySink;
    use crate::token::TokenAcquirer;
    use crate::types::{TokenCacheConfig, TokenResponse};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const URL: &str = "https://api.example.com/v1/items";

    struct CountingAcquirer {
        calls: AtomicU32,
        failures: u32,
    }

    #[async_trait]
    impl TokenAcquirer for CountingAcquirer {
        async fn acquire(&self, _credentials: &ClientCredentials) -> UpstreamResult<TokenResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                return Err(UpstreamError::Authentication {
                    destination: "login.example.com".to_string(),
                    message: "token endpoint unavailable".to_string(),
                    status: None,
                });
            }
            Ok(TokenResponse {
                access_token: format!("token-{}", n),
                token_type: "Bearer".to_string(),
                expires_in: Some(3600),
                scope: None,
            })
        }
    }

    struct Fixture {
        transport: Arc<MockHttpTransport>,
        sink: Arc<InMemorySink>,
        executor: RequestExecutor<MockHttpTransport>,
    }

    fn fixture(config: ClientConfig) -> Fixture {
        let transport = Arc::new(MockHttpTransport::new());
        let sink = Arc::new(InMemorySink::new());
        let executor = RequestExecutor::builder(transport.clone())
            .config(config)
            .sink(sink.clone())
            .build();
        Fixture {
            transport,
            sink,
            executor,
        }
    }

    fn authenticated(config: ClientConfig) -> (Fixture, Arc<CountingAcquirer>, Arc<TokenCache>) {
        authenticated_after_failures(config, 0)
    }

    fn authenticated_after_failures(
        config: ClientConfig,
        failures: u32,
    ) -> (Fixture, Arc<CountingAcquirer>, Arc<TokenCache>) {
        let transport = Arc::new(MockHttpTransport::new());
        let sink = Arc::new(InMemorySink::new());
        let acquirer = Arc::new(CountingAcquirer {
            calls: AtomicU32::new(0),
            failures,
        });
        let cache = Arc::new(TokenCache::new(acquirer.clone(), TokenCacheConfig::default()));
        let credentials = ClientCredentials::new("tenant", "client", "secret", "api://default");
        let executor = RequestExecutor::builder(transport.clone())
            .config(config)
            .sink(sink.clone())
            .token_cache(cache.clone(), credentials)
            .build();
        (
            Fixture {
                transport,
                sink,
                executor,
            },
            acquirer,
            cache,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_success() {
        let f = fixture(ClientConfig::default());
        f.transport.queue_json_response(200, &json!({"id": 1}));

        let response = f
            .executor
            .post(URL, json!({"name": "widget"}), false)
            .await
            .unwrap();

        assert!(!response.is_async());
        assert_eq!(response.json::<serde_json::Value>().unwrap()["id"], 1);

        let request = f.transport.get_last_request().unwrap();
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert!(request
            .header("user-agent")
            .unwrap()
            .starts_with("upstream-client/"));
        assert_eq!(request.body.clone().unwrap(), br#"{"name":"widget"}"#.to_vec());
        assert!(request.header("authorization").is_none());
        assert_eq!(f.executor.metrics().successful_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_makes_exactly_max_attempts() {
        let f = fixture(ClientConfig::default());
        f.transport
            .set_default_response(HttpResponse::json_body(503, &json!({"error": "busy"})));

        let error = f.executor.get(URL, false).await.unwrap_err();

        match &error {
            UpstreamError::OperationFailed {
                destination,
                attempts,
                last_status,
                source,
                ..
            } => {
                assert_eq!(destination, "api.example.com");
                assert_eq!(*attempts, 3);
                assert_eq!(*last_status, Some(503));
                assert!(matches!(
                    source.as_deref(),
                    Some(UpstreamError::Http { status: 503, .. })
                ));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(f.transport.call_count(), 3);
        assert_eq!(f.sink.events_named("retry_scheduled").len(), 2);
        assert_eq!(
            f.executor.metrics().errors.get("UPSTREAM_OPERATION_FAILED"),
            Some(&1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let f = fixture(ClientConfig::default());
        f.transport
            .queue_failure(TransportFailure::connection_reset("reset by peer"))
            .queue_json_response(200, &json!({"ok": true}));

        let response = f.executor.get(URL, false).await.unwrap();

        assert!(response.ok());
        assert_eq!(f.transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_status_fails_once() {
        let f = fixture(ClientConfig::default());
        f.transport
            .queue_json_response(404, &json!({"error": "not found"}));

        let error = f.executor.get(URL, false).await.unwrap_err();

        assert!(matches!(
            error,
            UpstreamError::OperationFailed {
                attempts: 1,
                last_status: Some(404),
                ..
            }
        ));
        assert_eq!(f.transport.call_count(), 1);
        // The destination answered; the breaker must not count it.
        let stats = f.executor.circuit_breakers().get("api.example.com").stats();
        assert_eq!(stats.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_open_fast_fail_skips_transport() {
        let config = ClientConfig::builder()
            .failure_threshold(2)
            .max_attempts(1)
            .build()
            .unwrap();
        let f = fixture(config);
        f.transport
            .set_default_response(HttpResponse::json_body(500, &json!({})));

        for _ in 0..2 {
            let _ = f.executor.get(URL, false).await;
        }
        let breaker = f.executor.circuit_breakers().get("api.example.com");
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(f.transport.call_count(), 2);

        let error = f.executor.get(URL, false).await.unwrap_err();

        assert!(matches!(
            error,
            UpstreamError::CircuitOpen {
                retry_in: Some(_),
                ..
            }
        ));
        assert_eq!(f.transport.call_count(), 2);
        assert_eq!(
            f.sink.circuit_transitions(),
            vec![(CircuitState::Closed, CircuitState::Open)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_takes_precedence() {
        let f = fixture(ClientConfig::default());
        f.transport
            .queue_response(
                HttpResponse::json_body(429, &json!({})).with_header("Retry-After", "7"),
            )
            .queue_json_response(200, &json!({}));
        let started = Instant::now();

        f.executor.get(URL, false).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(7));
        assert!(started.elapsed() < Duration::from_secs(8));
        match f.sink.events_named("retry_scheduled").as_slice() {
            [TelemetryEvent::RetryScheduled { delay, status, .. }] => {
                assert_eq!(*delay, Duration::from_secs(7));
                assert_eq!(*status, Some(429));
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_retry_after_falls_back_to_backoff() {
        let f = fixture(ClientConfig::default());
        f.transport
            .queue_response(
                HttpResponse::json_body(429, &json!({})).with_header("Retry-After", "1e20"),
            )
            .queue_json_response(200, &json!({}));

        f.executor.get(URL, false).await.unwrap();

        assert_eq!(f.transport.call_count(), 2);
        match f.sink.events_named("retry_scheduled").as_slice() {
            [TelemetryEvent::RetryScheduled { delay, .. }] => {
                assert!(*delay >= Duration::from_millis(800));
                assert!(*delay <= Duration::from_millis(1200));
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_beyond_clock_range_ends_call() {
        let f = fixture(ClientConfig::default());
        f.transport.set_default_response(
            HttpResponse::json_body(503, &json!({}))
                .with_header("Retry-After", "18000000000000000000"),
        );

        let error = f.executor.get(URL, false).await.unwrap_err();

        assert!(matches!(
            error,
            UpstreamError::CallTimeout {
                attempts: 1,
                ..
            }
        ));
        assert_eq!(f.transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_token_fetch_releases_half_open_probe() {
        let config = ClientConfig::builder()
            .failure_threshold(1)
            .circuit_timeout(Duration::from_secs(60))
            .max_attempts(1)
            .build()
            .unwrap();
        let (f, acquirer, _) = authenticated_after_failures(config, 1);
        f.transport
            .queue_json_response(500, &json!({}))
            .queue_json_response(200, &json!({}));

        f.executor.get(URL, false).await.unwrap_err();
        let breaker = f.executor.circuit_breakers().get("api.example.com");
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(61)).await;
        let error = f.executor.get(URL, true).await.unwrap_err();
        assert_eq!(error.error_code(), "UPSTREAM_AUTH");
        assert_eq!(f.transport.call_count(), 1);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        f.executor.get(URL, true).await.unwrap();
        assert_eq!(acquirer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(f.transport.call_count(), 2);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_deadline_stops_retries() {
        let config = ClientConfig::builder()
            .call_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let f = fixture(config);
        f.transport.set_default_response(
            HttpResponse::json_body(503, &json!({})).with_header("Retry-After", "10"),
        );

        let error = f.executor.get(URL, false).await.unwrap_err();

        assert!(matches!(
            error,
            UpstreamError::CallTimeout {
                attempts: 1,
                ..
            }
        ));
        assert_eq!(f.transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_rate_limit() {
        let config = ClientConfig::builder()
            .calls_per_second(1.0)
            .rate_limit_mode(RateLimitMode::FailFast)
            .build()
            .unwrap();
        let f = fixture(config);
        f.transport
            .set_default_response(HttpResponse::json_body(200, &json!({})));

        f.executor.get(URL, false).await.unwrap();
        let error = f.executor.get(URL, false).await.unwrap_err();

        assert!(matches!(error, UpstreamError::RateLimitExceeded { .. }));
        assert_eq!(f.transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_adapts_from_response_headers() {
        let f = fixture(ClientConfig::default());
        f.transport.queue_response(
            HttpResponse::json_body(200, &json!({}))
                .with_header("X-RateLimit-Limit", "100")
                .with_header("X-RateLimit-Remaining", "2"),
        );

        f.executor.get(URL, false).await.unwrap();

        let limiter = f
            .executor
            .rate_limiters()
            .for_url(&Url::parse(URL).unwrap());
        assert!((limiter.rate() - 3.0).abs() < 1e-9);
        assert_eq!(f.sink.events_named("rate_adjusted").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_operation_is_polled() {
        let (f, _, _) = authenticated(ClientConfig::default());
        f.transport
            .queue_response(
                HttpResponse::json_body(202, &json!({})).with_header("Location", "/status/123"),
            )
            .queue_json_response(200, &json!({"status": "processing"}))
            .queue_json_response(200, &json!({"status": "processing"}))
            .queue_json_response(200, &json!({"id": 123}));
        let started = Instant::now();

        let response = f
            .executor
            .post(URL, json!({"name": "job"}), true)
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(response.is_async());
        assert!(response.ok());
        let result = response.as_async().unwrap();
        assert_eq!(result.data(), &json!({"id": 123}));
        assert_eq!(result.original_response().status, 202);

        let requests = f.transport.get_requests();
        assert_eq!(requests.len(), 4);
        for poll in &requests[1..] {
            assert_eq!(poll.method, HttpMethod::Get);
            assert_eq!(poll.url, "https://api.example.com/status/123");
            assert_eq!(poll.header("authorization"), Some("Bearer token-1"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_without_reference_is_direct() {
        let f = fixture(ClientConfig::default());
        f.transport.queue_json_response(202, &json!({"queued": true}));

        let response = f.executor.post(URL, json!({}), false).await.unwrap();

        assert!(!response.is_async());
        assert_eq!(response.status_code(), 202);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bearer_token_injected_and_reused() {
        let (f, acquirer, _) = authenticated(ClientConfig::default());
        f.transport
            .set_default_response(HttpResponse::json_body(200, &json!({})));

        f.executor.get(URL, true).await.unwrap();
        f.executor.get(URL, true).await.unwrap();

        assert_eq!(acquirer.calls.load(Ordering::SeqCst), 1);
        let request = f.transport.get_last_request().unwrap();
        assert_eq!(request.header("authorization"), Some("Bearer token-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_invalidates_token_without_retry() {
        let (f, acquirer, cache) = authenticated(ClientConfig::default());
        f.transport
            .queue_json_response(401, &json!({"error": "invalid_token"}))
            .queue_json_response(200, &json!({}));

        let error = f.executor.get(URL, true).await.unwrap_err();

        assert!(matches!(
            error,
            UpstreamError::Authentication {
                status: Some(401),
                ..
            }
        ));
        assert_eq!(f.transport.call_count(), 1);
        assert!(cache.is_empty());

        f.executor.get(URL, true).await.unwrap();
        assert_eq!(acquirer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            f.transport.get_last_request().unwrap().header("authorization"),
            Some("Bearer token-2")
        );
    }

    #[tokio::test]
    async fn test_auth_required_without_credentials() {
        let f = fixture(ClientConfig::default());

        let error = f.executor.get(URL, true).await.unwrap_err();

        assert!(matches!(error, UpstreamError::Configuration { .. }));
        assert_eq!(f.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let f = fixture(ClientConfig::default());
        let error = f.executor.get("not a url", false).await.unwrap_err();
        assert!(matches!(error, UpstreamError::Configuration { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_json_reports_malformed_payload() {
        let f = fixture(ClientConfig::default());
        f.transport
            .queue_response(HttpResponse::new(200, Default::default(), b"<html>".to_vec()));

        let error = f
            .executor
            .execute_json::<serde_json::Value>(HttpMethod::Get, URL, None, false)
            .await
            .unwrap_err();

        match error {
            UpstreamError::MalformedResponse { destination, .. } => {
                assert_eq!(destination, "api.example.com")
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_headers_applied() {
        let config = ClientConfig::builder()
            .header("X-Tenant", "acme")
            .user_agent("inventory-sync/2.1")
            .build()
            .unwrap();
        let f = fixture(config);
        f.transport.queue_json_response(200, &json!({}));

        f.executor.delete(URL, false).await.unwrap();

        let request = f.transport.get_last_request().unwrap();
        assert_eq!(request.method, HttpMethod::Delete);
        assert_eq!(request.header("x-tenant"), Some("acme"));
        assert_eq!(request.header("user-agent"), Some("inventory-sync/2.1"));
    }
}
