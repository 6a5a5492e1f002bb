//! Token Acquisition
//!
//! Client-credentials grant against a tenant-specific token endpoint.

use async_trait::async_trait;
use base64::Engine;
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::form_urlencoded;

use crate::core::{HttpMethod, HttpRequest, HttpResponse, HttpTransport};
use crate::error::{UpstreamError, UpstreamResult};
use crate::resilience::{destination_key, parse_retry_after, RetryPolicy};
use crate::types::{ClientAuthMethod, ClientCredentials, TokenResponse};

/// Placeholder replaced by the tenant id in endpoint templates.
pub const TENANT_PLACEHOLDER: &str = "{tenant}";

/// Source of fresh tokens for the cache.
#[async_trait]
pub trait TokenAcquirer: Send + Sync {
    /// Request a new token for `credentials`.
    async fn acquire(&self, credentials: &ClientCredentials) -> UpstreamResult<TokenResponse>;
}

/// Client-credentials acquirer configuration.
#[derive(Debug, Clone)]
pub struct ClientCredentialsConfig {
    /// Token endpoint, optionally containing `{tenant}`.
    pub token_endpoint: String,
    /// Client authentication method.
    pub auth_method: ClientAuthMethod,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl ClientCredentialsConfig {
    /// Config for `token_endpoint` with body authentication.
    pub fn new(token_endpoint: impl Into<String>) -> Self {
        Self {
            token_endpoint: token_endpoint.into(),
            auth_method: ClientAuthMethod::default(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Sets the client authentication method.
    pub fn with_auth_method(mut self, method: ClientAuthMethod) -> Self {
        self.auth_method = method;
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Client-credentials acquirer over an [`HttpTransport`].
pub struct ClientCredentialsAcquirer<T: HttpTransport> {
    config: ClientCredentialsConfig,
    transport: Arc<T>,
    retry: RetryPolicy,
}

impl<T: HttpTransport> ClientCredentialsAcquirer<T> {
    /// Create new acquirer.
    pub fn new(config: ClientCredentialsConfig, transport: Arc<T>) -> Self {
        Self {
            config,
            transport,
            retry: RetryPolicy::default(),
        }
    }

    /// Retry transient token endpoint failures with `policy`.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    fn endpoint(&self, credentials: &ClientCredentials) -> UpstreamResult<url::Url> {
        let tenant: String =
            form_urlencoded::byte_serialize(credentials.tenant_id.as_bytes()).collect();
        let raw = self.config.token_endpoint.replace(TENANT_PLACEHOLDER, &tenant);
        Ok(url::Url::parse(&raw)?)
    }

    fn build_request_body(&self, credentials: &ClientCredentials) -> String {
        let mut form = form_urlencoded::Serializer::new(String::new());
        form.append_pair("grant_type", "client_credentials");
        if !credentials.scope.is_empty() {
            form.append_pair("scope", &credentials.scope);
        }
        if self.config.auth_method == ClientAuthMethod::RequestBody {
            form.append_pair("client_id", &credentials.client_id);
            form.append_pair("client_secret", credentials.client_secret.expose_secret());
        }
        form.finish()
    }

    fn build_request_headers(&self, credentials: &ClientCredentials) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert(
            "content-type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        );
        headers.insert("accept".to_string(), "application/json".to_string());

        if self.config.auth_method == ClientAuthMethod::BasicAuth {
            let pair = format!(
                "{}:{}",
                credentials.client_id,
                credentials.client_secret.expose_secret()
            );
            let encoded = base64::engine::general_purpose::STANDARD.encode(pair);
            headers.insert("authorization".to_string(), format!("Basic {}", encoded));
        }

        headers
    }

    async fn request_once(
        &self,
        request: HttpRequest,
        destination: &str,
    ) -> UpstreamResult<TokenResponse> {
        let response = self
            .transport
            .send(request)
            .await
            .map_err(|failure| UpstreamError::Transport {
                destination: destination.to_string(),
                failure,
            })?;

        if !response.is_success() {
            return Err(self.error_from_response(&response, destination));
        }

        response.json::<TokenResponse>().map_err(|e| {
            UpstreamError::malformed(destination, format!("Invalid token response: {}", e))
        })
    }

    fn error_from_response(&self, response: &HttpResponse, destination: &str) -> UpstreamError {
        if self.retry.is_retryable_status(response.status) {
            return UpstreamError::Http {
                destination: destination.to_string(),
                status: response.status,
                body: Some(response.text()),
                retry_after: response.header("retry-after").and_then(parse_retry_after),
                transient: true,
            };
        }

        let message = response
            .json::<serde_json::Value>()
            .ok()
            .and_then(|body| {
                let error = body.get("error").and_then(|v| v.as_str());
                let description = body.get("error_description").and_then(|v| v.as_str());
                match (error, description) {
                    (Some(e), Some(d)) => Some(format!("{}: {}", e, d)),
                    (Some(e), None) => Some(e.to_string()),
                    (None, Some(d)) => Some(d.to_string()),
                    (None, None) => None,
                }
            })
            .unwrap_or_else(|| format!("Token endpoint returned HTTP {}", response.status));

        UpstreamError::Authentication {
            destination: destination.to_string(),
            message,
            status: Some(response.status),
        }
    }
}

#[async_trait]
impl<T: HttpTransport> TokenAcquirer for ClientCredentialsAcquirer<T> {
    async fn acquire(&self, credentials: &ClientCredentials) -> UpstreamResult<TokenResponse> {
        let url = self.endpoint(credentials)?;
        let destination = destination_key(&url);
        let request = HttpRequest {
            method: HttpMethod::Post,
            url: url.to_string(),
            headers: self.build_request_headers(credentials),
            body: Some(self.build_request_body(credentials).into_bytes()),
            timeout: Some(self.config.timeout),
        };

        debug!(
            destination = %destination,
            tenant_id = %credentials.tenant_id,
            client_id = %credentials.client_id,
            "Requesting client credentials token"
        );

        self.retry
            .execute(&destination, |_| self.request_once(request.clone(), &destination))
            .await
            .map_err(|error| match error {
                UpstreamError::Authentication { .. } => error,
                other => UpstreamError::Authentication {
                    destination: destination.clone(),
                    status: other.status_code(),
                    message: other.to_string(),
                },
            })
    }
}
