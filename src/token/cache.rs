//! Token Cache
//!
//! Expiry-aware bearer token cache with per-key request coalescing: while an
//! acquisition for a key is in flight, every other caller for that key waits
//! on the same future instead of hitting the token endpoint again.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{UpstreamError, UpstreamResult};
use crate::telemetry::{NoOpSink, SharedSink, TelemetryEvent};
use crate::token::acquirer::TokenAcquirer;
use crate::types::{AccessToken, ClientCredentials, TokenCacheConfig, TokenKey};

/// Acquisition failure shared with every waiter of one in-flight request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    pub destination: String,
    pub message: String,
    pub status: Option<u16>,
}

impl From<UpstreamError> for AuthFailure {
    fn from(error: UpstreamError) -> Self {
        match error {
            UpstreamError::Authentication {
                destination,
                message,
                status,
            } => Self {
                destination,
                message,
                status,
            },
            other => Self {
                destination: other.destination().unwrap_or("token endpoint").to_string(),
                status: other.status_code(),
                message: other.to_string(),
            },
        }
    }
}

impl From<AuthFailure> for UpstreamError {
    fn from(failure: AuthFailure) -> Self {
        UpstreamError::Authentication {
            destination: failure.destination,
            message: failure.message,
            status: failure.status,
        }
    }
}

type Acquisition = Shared<BoxFuture<'static, Result<AccessToken, AuthFailure>>>;

/// Cache of bearer tokens keyed by tenant, client and scope.
pub struct TokenCache {
    acquirer: Arc<dyn TokenAcquirer>,
    config: TokenCacheConfig,
    entries: Arc<Mutex<HashMap<TokenKey, AccessToken>>>,
    in_flight: Arc<Mutex<HashMap<TokenKey, Acquisition>>>,
    sink: SharedSink,
}

impl TokenCache {
    /// Create new token cache.
    pub fn new(acquirer: Arc<dyn TokenAcquirer>, config: TokenCacheConfig) -> Self {
        Self {
            acquirer,
            config,
            entries: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            sink: Arc::new(NoOpSink),
        }
    }

    /// Route acquisition events to `sink`.
    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Safety margin applied before expiry.
    pub fn safety_margin(&self) -> Duration {
        self.config.safety_margin
    }

    /// A valid token for `credentials`, acquiring one if needed.
    pub async fn get_token(&self, credentials: &ClientCredentials) -> UpstreamResult<AccessToken> {
        let key = credentials.key();

        if let Some(token) = self.cached(&key) {
            debug!(key = %key, "Using cached access token");
            return Ok(token);
        }

        let acquisition = {
            let mut in_flight = self.in_flight.lock();
            // An acquisition may have landed since the lookup above.
            if let Some(token) = self.cached(&key) {
                return Ok(token);
            }
            match in_flight.get(&key) {
                Some(pending) => {
                    debug!(key = %key, "Joining in-flight token acquisition");
                    pending.clone()
                }
                None => {
                    let pending = self.start_acquisition(key.clone(), credentials.clone());
                    in_flight.insert(key, pending.clone());
                    pending
                }
            }
        };

        acquisition.await.map_err(UpstreamError::from)
    }

    /// Drop the cached token for `credentials`.
    pub fn invalidate(&self, credentials: &ClientCredentials) -> bool {
        self.entries.lock().remove(&credentials.key()).is_some()
    }

    /// Drop every cached token.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of cached entries, including ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cached(&self, key: &TokenKey) -> Option<AccessToken> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(token) if token.is_valid(self.config.safety_margin) => Some(token.clone()),
            Some(_) => {
                debug!(key = %key, "Evicting expired access token");
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn start_acquisition(&self, key: TokenKey, credentials: ClientCredentials) -> Acquisition {
        let acquirer = self.acquirer.clone();
        let entries = self.entries.clone();
        let in_flight = self.in_flight.clone();
        let sink = self.sink.clone();

        async move {
            let result = acquirer.acquire(&credentials).await;

            let outcome = match result {
                Ok(response) => {
                    let token = AccessToken::from_response(&response);
                    entries.lock().insert(key.clone(), token.clone());
                    sink.emit(&TelemetryEvent::TokenAcquired {
                        tenant_id: credentials.tenant_id.clone(),
                        client_id: credentials.client_id.clone(),
                        scope: credentials.scope.clone(),
                        expires_in: response.lifetime(),
                    });
                    Ok(token)
                }
                Err(error) => Err(AuthFailure::from(error)),
            };

            in_flight.lock().remove(&key);
            outcome
        }
        .boxed()
        .shared()
    }
}
