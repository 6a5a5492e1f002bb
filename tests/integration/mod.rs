//! Integration tests using WireMock
//!
//! These tests drive the real reqwest transport against a mock HTTP server,
//! covering the full request/response cycle including retries, polling,
//! authentication and quota header handling.

pub mod executor;
pub mod token;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;
use upstream_client::{
    client_config, ClientConfigBuilder, InMemorySink, ReqwestHttpTransport, RequestExecutor,
};
use wiremock::{MockServer, ResponseTemplate};

/// Helper to start a mock server
pub async fn setup_mock_server() -> MockServer {
    MockServer::start().await
}

/// Helper to create success response templates
pub fn success_response(body: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(body)
}

/// Helper to create error response templates
pub fn error_response(status: u16, body: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(body)
}

/// Configuration with short, deterministic delays.
pub fn fast_config() -> ClientConfigBuilder {
    client_config()
        .calls_per_second(1000.0)
        .burst_size(10)
        .base_delay(Duration::from_millis(10))
        .jitter(1.0, 1.0)
        .poll_interval(Duration::from_millis(20))
        .max_wait(Duration::from_secs(5))
        .call_timeout(Duration::from_secs(10))
}

pub fn transport() -> Arc<ReqwestHttpTransport> {
    Arc::new(ReqwestHttpTransport::new().expect("Failed to build transport"))
}

/// Executor over the real transport with events captured in memory.
pub fn executor(
    config: ClientConfigBuilder,
) -> (RequestExecutor<ReqwestHttpTransport>, Arc<InMemorySink>) {
    let sink = Arc::new(InMemorySink::new());
    let executor = RequestExecutor::builder(transport())
        .config(config.build().expect("Invalid test config"))
        .sink(sink.clone())
        .build();
    (executor, sink)
}
