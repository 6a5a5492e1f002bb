//! Integration tests for the request executor

use super::*;
use serde_json::json;
use std::time::Duration;
use upstream_client::{CircuitState, HttpMethod, UpstreamError};
use url::Url;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::Mock;

#[tokio::test]
async fn test_retries_transient_status_then_succeeds() {
    let mock_server = setup_mock_server().await;

    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(error_response(503, json!({"error": "unavailable"})))
        .up_to_n_times(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(success_response(json!({"items": [1, 2, 3]})))
        .mount(&mock_server)
        .await;

    let (executor, sink) = executor(fast_config());
    let response = executor
        .get(&format!("{}/items", mock_server.uri()), false)
        .await
        .expect("call should succeed after retries");

    assert!(response.ok());
    assert_eq!(response.json::<serde_json::Value>().unwrap()["items"][2], 3);
    assert_eq!(mock_server.received_requests().await.unwrap().len(), 3);
    assert_eq!(sink.events_named("retry_scheduled").len(), 2);
}

#[tokio::test]
async fn test_exhausted_retries_report_attempts_and_status() {
    let mock_server = setup_mock_server().await;

    Mock::given(method("GET"))
        .respond_with(error_response(429, json!({"error": "slow down"})))
        .expect(3)
        .mount(&mock_server)
        .await;

    let (executor, _) = executor(fast_config());
    let error = executor
        .get(&format!("{}/items", mock_server.uri()), false)
        .await
        .unwrap_err();

    match error {
        UpstreamError::OperationFailed {
            attempts,
            last_status,
            ..
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(last_status, Some(429));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_accepted_operation_completes_through_polling() {
    let mock_server = setup_mock_server().await;

    Mock::given(method("POST"))
        .and(path("/exports"))
        .and(body_json(json!({"format": "csv"})))
        .respond_with(ResponseTemplate::new(202).insert_header("Location", "/exports/42/status"))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/exports/42/status"))
        .respond_with(success_response(json!({"status": "running"})))
        .up_to_n_times(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/exports/42/status"))
        .respond_with(success_response(json!({"status": "succeeded", "id": 42})))
        .mount(&mock_server)
        .await;

    let (executor, sink) = executor(fast_config());
    let response = executor
        .post(
            &format!("{}/exports", mock_server.uri()),
            json!({"format": "csv"}),
            false,
        )
        .await
        .expect("operation should complete");

    assert!(response.is_async());
    let result = response.as_async().unwrap();
    assert_eq!(result.data()["id"], 42);
    assert_eq!(result.original_response().status, 202);
    assert_eq!(sink.events_named("async_operation_polled").len(), 3);
}

#[tokio::test]
async fn test_failed_operation_surfaces_details() {
    let mock_server = setup_mock_server().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202).insert_header("Location", "/ops/7"))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ops/7"))
        .respond_with(success_response(
            json!({"status": "failed", "error": {"message": "schema mismatch"}}),
        ))
        .mount(&mock_server)
        .await;

    let (executor, _) = executor(fast_config());
    let error = executor
        .post(&format!("{}/imports", mock_server.uri()), json!({}), false)
        .await
        .unwrap_err();

    match error {
        UpstreamError::OperationFailed { message, .. } => {
            assert!(message.contains("schema mismatch"));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_poll_deadline_is_reported_as_operation_timeout() {
    let mock_server = setup_mock_server().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202).insert_header("Location", "/ops/slow"))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ops/slow"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&mock_server)
        .await;

    let (executor, _) = executor(fast_config().max_wait(Duration::from_millis(100)));
    let error = executor
        .post(&format!("{}/reports", mock_server.uri()), json!({}), false)
        .await
        .unwrap_err();

    assert!(matches!(error, UpstreamError::OperationTimeout { .. }));
}

#[tokio::test]
async fn test_circuit_opens_after_server_errors() {
    let mock_server = setup_mock_server().await;

    Mock::given(method("GET"))
        .respond_with(error_response(500, json!({"error": "boom"})))
        .expect(2)
        .mount(&mock_server)
        .await;

    let (executor, sink) = executor(fast_config().failure_threshold(2).max_attempts(1));
    let url = format!("{}/items", mock_server.uri());

    for _ in 0..2 {
        let error = executor.get(&url, false).await.unwrap_err();
        assert!(matches!(
            error,
            UpstreamError::OperationFailed {
                last_status: Some(500),
                ..
            }
        ));
    }

    let error = executor.get(&url, false).await.unwrap_err();
    assert!(matches!(error, UpstreamError::CircuitOpen { .. }));
    assert_eq!(mock_server.received_requests().await.unwrap().len(), 2);
    assert_eq!(
        sink.circuit_transitions(),
        vec![(CircuitState::Closed, CircuitState::Open)]
    );
}

#[tokio::test]
async fn test_rate_adapts_to_quota_headers() {
    let mock_server = setup_mock_server().await;

    Mock::given(method("GET"))
        .respond_with(
            success_response(json!({}))
                .insert_header("X-RateLimit-Limit", "100")
                .insert_header("X-RateLimit-Remaining", "2"),
        )
        .mount(&mock_server)
        .await;

    let (executor, sink) = executor(fast_config().calls_per_second(10.0));
    let url = format!("{}/items", mock_server.uri());
    executor.get(&url, false).await.unwrap();

    let limiter = executor.rate_limiters().for_url(&Url::parse(&url).unwrap());
    assert!((limiter.rate() - 3.0).abs() < 1e-9);
    assert_eq!(sink.events_named("rate_adjusted").len(), 1);
}

#[tokio::test]
async fn test_call_timeout_bounds_slow_upstream() {
    let mock_server = setup_mock_server().await;

    Mock::given(method("GET"))
        .respond_with(success_response(json!({})).set_delay(Duration::from_millis(500)))
        .mount(&mock_server)
        .await;

    let (executor, _) = executor(fast_config().call_timeout(Duration::from_millis(100)));
    let error = executor
        .get(&format!("{}/items", mock_server.uri()), false)
        .await
        .unwrap_err();

    assert!(matches!(error, UpstreamError::CallTimeout { attempts: 1, .. }));
}

#[tokio::test]
async fn test_default_headers_reach_upstream() {
    let mock_server = setup_mock_server().await;

    Mock::given(method("DELETE"))
        .and(path("/items/9"))
        .and(header("x-tenant", "acme"))
        .and(header("user-agent", "inventory-sync/2.1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (executor, _) = executor(
        fast_config()
            .header("X-Tenant", "acme")
            .user_agent("inventory-sync/2.1"),
    );
    let response = executor
        .execute(
            HttpMethod::Delete,
            &format!("{}/items/9", mock_server.uri()),
            None,
            false,
        )
        .await
        .unwrap();

    assert_eq!(response.status_code(), 204);
    assert!(response.content().is_empty());
}
