//! Token Types
//!
//! Token endpoint response and cached bearer tokens.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use tokio::time::Instant;

/// Token lifetime assumed when the endpoint omits `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Longest lifetime a cached token is trusted for.
pub const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(365 * 24 * 3600);

/// Token response from the token endpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct TokenResponse {
    /// Access token.
    pub access_token: String,
    /// Token type (usually "Bearer").
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Lifetime in seconds. Some providers send it as a string.
    #[serde(default, deserialize_with = "deserialize_expires_in")]
    pub expires_in: Option<u64>,
    /// Granted scope.
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

fn deserialize_expires_in<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        String(String),
    }

    match Option::<NumberOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Number(n)) => Ok(Some(n)),
        Some(NumberOrString::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

impl TokenResponse {
    /// Token lifetime.
    pub fn lifetime(&self) -> Duration {
        self.expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME)
    }
}

/// Bearer token held by the cache.
#[derive(Clone, Debug)]
pub struct AccessToken {
    secret: SecretString,
    token_type: String,
    expires_at: Instant,
}

impl AccessToken {
    /// Token that expires `lifetime` from now, capped at
    /// [`MAX_TOKEN_LIFETIME`].
    pub fn new(value: impl Into<String>, token_type: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            secret: SecretString::new(value.into()),
            token_type: token_type.into(),
            expires_at: Instant::now() + lifetime.min(MAX_TOKEN_LIFETIME),
        }
    }

    /// Build from a token endpoint response.
    pub fn from_response(response: &TokenResponse) -> Self {
        Self::new(
            response.access_token.clone(),
            response.token_type.clone(),
            response.lifetime(),
        )
    }

    /// Raw token value.
    pub fn secret(&self) -> &str {
        self.secret.expose_secret()
    }

    /// Token type as issued.
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// Value for the `Authorization` header.
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.secret.expose_secret())
    }

    /// Expiry instant.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Whether the token is still usable `margin` before its expiry.
    pub fn is_valid(&self, margin: Duration) -> bool {
        Instant::now() + margin < self.expires_at
    }
}
