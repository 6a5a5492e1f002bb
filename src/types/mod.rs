//! Types
//!
//! Configuration, credential, token and response types.

pub mod config;
pub mod credentials;
pub mod response;
pub mod token;

pub use config::{
    ClientConfig, PollerConfig, RateLimitMode, TokenCacheConfig, DEFAULT_CALL_TIMEOUT,
    DEFAULT_USER_AGENT,
};
pub use credentials::{ClientAuthMethod, ClientCredentials, TokenKey};
pub use response::{AsyncOperationResult, UpstreamResponse};
pub use token::{AccessToken, TokenResponse, DEFAULT_TOKEN_LIFETIME, MAX_TOKEN_LIFETIME};
