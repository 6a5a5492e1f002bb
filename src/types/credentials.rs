//! Credential Types
//!
//! Client-credentials identity and the cache key derived from it.

use secrecy::SecretString;
use std::fmt;

/// How the client authenticates at the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientAuthMethod {
    /// `client_id` and `client_secret` as form fields.
    #[default]
    RequestBody,
    /// HTTP Basic authentication header.
    BasicAuth,
}

/// Client-credentials identity for one tenant.
#[derive(Clone)]
pub struct ClientCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub scope: String,
}

impl ClientCredentials {
    /// Create credentials.
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: SecretString::new(client_secret.into()),
            scope: scope.into(),
        }
    }

    /// Cache key for tokens issued to these credentials.
    pub fn key(&self) -> TokenKey {
        TokenKey {
            tenant_id: self.tenant_id.clone(),
            client_id: self.client_id.clone(),
            scope: self.scope.clone(),
        }
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("scope", &self.scope)
            .finish()
    }
}

/// Token cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
    pub tenant_id: String,
    pub client_id: String,
    pub scope: String,
}

impl fmt::Display for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.client_id, self.scope)
    }
}
