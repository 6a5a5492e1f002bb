//! Integration tests for the reqwest transport

use super::*;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use upstream_client::{HttpMethod, HttpRequest, HttpTransport, TransportErrorKind};
use wiremock::matchers::{body_string, header, method, path};
use wiremock::Mock;

#[tokio::test]
async fn test_send_returns_status_headers_and_body() {
    let mock_server = setup_mock_server().await;

    Mock::given(method("GET"))
        .and(path("/hello"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Request-Id", "req-1")
                .set_body_string("hi"),
        )
        .mount(&mock_server)
        .await;

    let response = assert_ok!(
        transport()
            .send(HttpRequest::get(format!("{}/hello", mock_server.uri())))
            .await
    );

    assert_eq!(response.status, 200);
    assert_eq!(response.header("x-request-id"), Some("req-1"));
    assert_eq!(response.header("X-Request-Id"), Some("req-1"));
    assert_eq!(response.text(), "hi");
}

#[tokio::test]
async fn test_send_forwards_method_headers_and_body() {
    let mock_server = setup_mock_server().await;

    Mock::given(method("PATCH"))
        .and(path("/items/1"))
        .and(header("content-type", "application/json"))
        .and(body_string(r#"{"qty":2}"#))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let request = HttpRequest::new(HttpMethod::Patch, format!("{}/items/1", mock_server.uri()))
        .with_header("Content-Type", "application/json")
        .with_body(br#"{"qty":2}"#.to_vec());

    let response = assert_ok!(transport().send(request).await);
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn test_redirects_are_not_followed() {
    let mock_server = setup_mock_server().await;

    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/new"))
        .mount(&mock_server)
        .await;

    let response = assert_ok!(
        transport()
            .send(HttpRequest::get(format!("{}/old", mock_server.uri())))
            .await
    );

    assert_eq!(response.status, 302);
    assert_eq!(response.header("location"), Some("/new"));
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let mock_server = setup_mock_server().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("0123456789abcdef"))
        .mount(&mock_server)
        .await;

    let transport = ReqwestHttpTransport::with_options(Duration::from_secs(5), 8).unwrap();
    let failure = assert_err!(
        transport
            .send(HttpRequest::get(format!("{}/big", mock_server.uri())))
            .await
    );

    assert_eq!(failure.kind, TransportErrorKind::Body);
    assert!(!failure.is_transient());
}

#[tokio::test]
async fn test_request_timeout_is_transient() {
    let mock_server = setup_mock_server().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&mock_server)
        .await;

    let request = HttpRequest::get(format!("{}/slow", mock_server.uri()))
        .with_timeout(Duration::from_millis(50));
    let failure = assert_err!(transport().send(request).await);

    assert_eq!(failure.kind, TransportErrorKind::Timeout);
    assert!(failure.is_transient());
}

#[tokio::test]
async fn test_connection_refused_is_transient() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let request = HttpRequest::get(format!("http://127.0.0.1:{}/", port));
    let failure = assert_err!(transport().send(request).await);
    assert_eq!(failure.kind, TransportErrorKind::Connect);
    assert!(failure.is_transient());
}
